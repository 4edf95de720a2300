use super::{load_journal, load_snapshot};
use crate::Context;
use crate::cli::ReplayArgs;
use crate::ui;
use anyhow::{Context as _, Result};
use ledger::{JournalEntry, Replayer, Snapshot, replay};

pub fn run(ctx: &Context, args: &ReplayArgs) -> Result<()> {
    let base = load_snapshot(&args.base)?;
    let mut entries = load_journal(&args.journal)?;
    if let Some(prefix) = args.prefix {
        if prefix > entries.len() {
            ui::warn(&format!(
                "Journal has only {}; replaying all of them",
                ui::count(entries.len(), "entry")
            ));
        }
        entries.truncate(prefix);
    }

    // stdout carries the snapshot when there is no --out
    if !ctx.quiet && args.out.is_some() {
        ui::info(&format!(
            "Replaying {} onto {}",
            ui::count(entries.len(), "entry"),
            args.base.display()
        ));
    }

    if args.check_prefixes || ctx.config.replay.check_prefixes {
        check_prefixes(&base, &entries)?;
        if !ctx.quiet && args.out.is_some() {
            ui::success(&format!("All {} prefixes verify", entries.len() + 1));
        }
    }

    let snapshot = match replay(&base, &entries) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            if let (Some(partial), Some(out)) = (&e.partial, &args.out) {
                partial.save(out)?;
                ui::warn(&format!("Wrote the partial snapshot to {}", out.display()));
            }
            return Err(anyhow::Error::new(e.source).context("Replay failed"));
        }
    };

    match &args.out {
        Some(out) => {
            snapshot.save(out)?;
            if !ctx.quiet {
                ui::success(&format!(
                    "Replayed {} onto {} ({})",
                    ui::count(entries.len(), "entry"),
                    args.base.display(),
                    ui::count(snapshot.resources.len(), "resource")
                ));
                ui::dim(&format!("Written to {}", out.display()));
            }
        }
        None => println!("{}", serde_json::to_string_pretty(&snapshot)?),
    }
    Ok(())
}

/// Apply entries one at a time and verify the snapshot after each.
fn check_prefixes(base: &Snapshot, entries: &[JournalEntry]) -> Result<()> {
    let mut replayer = Replayer::new(base);
    replayer
        .snapshot()
        .verify_integrity()
        .context("Base snapshot failed verification")?;
    for (index, entry) in entries.iter().enumerate() {
        replayer
            .apply(entry)
            .with_context(|| format!("Entry {} (seq {}) could not be applied", index + 1, entry.seq))?;
        replayer
            .snapshot()
            .verify_integrity()
            .with_context(|| format!("Snapshot after entry {} (seq {}) failed verification", index + 1, entry.seq))?;
    }
    log::debug!("Verified {} prefixes", entries.len() + 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use ledger::{Journal, JsonLinesPersister, ResourceState, Step, Urn};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn ctx() -> Context {
        Context {
            quiet: true,
            config: Config::default(),
        }
    }

    fn create(name: &str, parent: Option<&Urn>) -> Step {
        let mut state = ResourceState::new(Urn::new("dev", "site", None, "site:index:App", name), "site:index:App", false);
        state.parent = parent.cloned();
        Step::Create { new: Box::new(state) }
    }

    /// Base snapshot and a journal creating `app` and its child.
    fn fixture(dir: &Path) -> (PathBuf, PathBuf) {
        let base = dir.join("base.json");
        Snapshot::default().save(&base).unwrap();
        let journal_path = dir.join("journal.jsonl");
        let journal = Journal::with_persister(Box::new(JsonLinesPersister::open(&journal_path).unwrap()));
        let app = create("app", None);
        let child = create("child", Some(app.urn()));
        for step in [app, child] {
            let begun = journal.begin(step.clone()).unwrap();
            journal.end(begun, step, true).unwrap();
        }
        drop(journal);
        (base, journal_path)
    }

    fn args(base: PathBuf, journal: PathBuf, out: PathBuf) -> ReplayArgs {
        ReplayArgs {
            base,
            journal,
            prefix: None,
            out: Some(out),
            check_prefixes: true,
        }
    }

    #[test]
    fn test_replay_writes_snapshot() {
        let dir = TempDir::new().unwrap();
        let (base, journal) = fixture(dir.path());
        let out = dir.path().join("next.json");

        run(&ctx(), &args(base, journal, out.clone())).unwrap();
        let snapshot = Snapshot::load(&out).unwrap();
        assert_eq!(snapshot.resources.len(), 2);
        assert!(snapshot.verify_integrity().is_ok());
    }

    #[test]
    fn test_prefix_stops_early() {
        let dir = TempDir::new().unwrap();
        let (base, journal) = fixture(dir.path());
        let out = dir.path().join("next.json");

        // Begin and Success of the first step only
        let args = ReplayArgs {
            prefix: Some(2),
            ..args(base, journal, out.clone())
        };
        run(&ctx(), &args).unwrap();
        let snapshot = Snapshot::load(&out).unwrap();
        assert_eq!(snapshot.resources.len(), 1);
        assert_eq!(snapshot.resources[0].urn.name(), "app");
    }

    #[test]
    fn test_check_prefixes_rejects_inconsistent_base() {
        let dir = TempDir::new().unwrap();
        let (_, journal) = fixture(dir.path());
        let base = dir.path().join("bad.json");
        let app = ResourceState::new(Urn::new("dev", "site", None, "site:index:App", "app"), "site:index:App", false);
        let mut orphan = app.clone();
        orphan.urn = Urn::new("dev", "site", None, "site:index:App", "orphan");
        orphan.parent = Some(Urn::new("dev", "site", None, "site:index:App", "gone"));
        Snapshot::new(vec![app, orphan]).save(&base).unwrap();

        let err = run(&ctx(), &args(base, journal, dir.path().join("next.json"))).unwrap_err();
        assert!(format!("{err:#}").contains("Base snapshot failed verification"));
    }
}
