use colored::{ColoredString, Colorize};
use ledger::StepOp;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Plain marker for an operation, as in a plan listing.
pub fn op_marker(op: StepOp) -> &'static str {
    match op {
        StepOp::Create | StepOp::CreateReplacement => "+",
        StepOp::Delete | StepOp::DeleteReplaced => "-",
        StepOp::Update => "~",
        StepOp::Replace => "+-",
        StepOp::Read | StepOp::ReadReplacement | StepOp::Refresh => ">",
        StepOp::Import | StepOp::ImportReplacement => "=",
        StepOp::ReadDiscard | StepOp::DiscardReplaced => "<",
        StepOp::Same => " ",
    }
}

/// Operation marker colored by effect.
pub fn op_symbol(op: StepOp) -> ColoredString {
    let marker = op_marker(op);
    match op {
        StepOp::Create | StepOp::CreateReplacement | StepOp::Import | StepOp::ImportReplacement => marker.green(),
        StepOp::Delete | StepOp::DeleteReplaced => marker.red(),
        StepOp::Update => marker.yellow(),
        StepOp::Replace => marker.magenta(),
        StepOp::Read | StepOp::ReadReplacement | StepOp::Refresh => marker.cyan(),
        StepOp::ReadDiscard | StepOp::DiscardReplaced | StepOp::Same => marker.dimmed(),
    }
}

/// Pluralize a count for display: `1 resource`, `2 resources`, `3 entries`.
pub fn count(n: usize, noun: &str) -> String {
    if n == 1 {
        return format!("{n} {noun}");
    }
    match noun.strip_suffix('y') {
        Some(stem) if !stem.ends_with(['a', 'e', 'o', 'u']) => format!("{n} {stem}ies"),
        _ => format!("{n} {noun}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count() {
        assert_eq!(count(0, "resource"), "0 resources");
        assert_eq!(count(1, "resource"), "1 resource");
        assert_eq!(count(12, "change"), "12 changes");
        assert_eq!(count(1, "entry"), "1 entry");
        assert_eq!(count(3, "entry"), "3 entries");
        assert_eq!(count(2, "key"), "2 keys");
    }

    #[test]
    fn test_op_marker() {
        assert_eq!(op_marker(StepOp::Create), "+");
        assert_eq!(op_marker(StepOp::Replace), "+-");
        assert_eq!(op_marker(StepOp::DeleteReplaced), "-");
        assert_eq!(op_marker(StepOp::Same), " ");
    }
}
