//! Registration intake: turns what the program declares into resolved goals.
//!
//! Intake runs on the deployment loop only. It applies transforms, derives
//! URNs, inherits protect and provider settings from parents, resolves
//! aliases, and rejects option combinations that make no sense for the kind
//! of resource being registered.

use crate::error::{Diagnostic, DiagnosticKind, RegistrationError};
use crate::goal::{Alias, AliasParent, Goal, ReadGoal, ReadResource, RegisterResource, Transform};
use ledger::{ProviderRef, Urn, is_provider_type, package_of};
use std::collections::HashMap;

/// What intake remembers about an already registered resource.
#[derive(Debug, Clone)]
struct Registered {
    protect: bool,
    provider: Option<ProviderRef>,
    transforms: Vec<Transform>,
    parent: Option<Urn>,
}

/// A resolved goal plus any non-fatal problems found while resolving it.
#[derive(Debug)]
pub struct Prepared {
    pub goal: Goal,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Default)]
pub struct Intake {
    stack: String,
    project: String,
    stack_transforms: Vec<Transform>,
    registered: HashMap<Urn, Registered>,
}

impl Intake {
    pub fn new(stack: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            project: project.into(),
            ..Self::default()
        }
    }

    pub fn with_stack_transforms(mut self, transforms: Vec<Transform>) -> Self {
        self.stack_transforms = transforms;
        self
    }

    /// Transforms inherited by children of `parent`, nearest ancestor first.
    fn inherited_transforms(&self, parent: Option<&Urn>) -> Vec<Transform> {
        let mut transforms = Vec::new();
        let mut next = parent;
        while let Some(urn) = next {
            let Some(registered) = self.registered.get(urn) else {
                break;
            };
            transforms.extend(registered.transforms.iter().cloned());
            next = registered.parent.as_ref();
        }
        transforms
    }

    fn apply_transforms(&self, args: &mut RegisterResource) -> Result<(), RegistrationError> {
        let own = args.options.transforms.clone();
        let inherited = self.inherited_transforms(args.options.parent.as_ref());
        for transform in own.iter().chain(&inherited).chain(&self.stack_transforms) {
            transform
                .apply(args)
                .map_err(|e| RegistrationError::Invalid {
                    name: args.name.clone(),
                    message: format!("transform failed: {e:#}"),
                })?;
        }
        Ok(())
    }

    fn urn_for(&self, parent: Option<&Urn>, ty: &str, name: &str) -> Urn {
        Urn::new(
            &self.stack,
            &self.project,
            parent.map(Urn::qualified_type),
            ty,
            name,
        )
    }

    fn check_parent(&self, parent: Option<&Urn>, name: &str) -> Result<(), RegistrationError> {
        match parent {
            Some(parent) if !self.registered.contains_key(parent) => Err(RegistrationError::Invalid {
                name: name.to_string(),
                message: format!("parent {parent} has not been registered"),
            }),
            _ => Ok(()),
        }
    }

    fn resolve_alias(&self, alias: &Alias, args: &RegisterResource) -> Urn {
        match alias {
            Alias::Urn(urn) => urn.clone(),
            Alias::Spec(spec) => {
                let parent_type = match &spec.parent {
                    AliasParent::Inherit => args.options.parent.as_ref().map(Urn::qualified_type),
                    AliasParent::Root => None,
                    AliasParent::Urn(parent) => Some(parent.qualified_type()),
                };
                Urn::new(
                    spec.stack.as_deref().unwrap_or(&self.stack),
                    spec.project.as_deref().unwrap_or(&self.project),
                    parent_type,
                    spec.ty.as_deref().unwrap_or(&args.ty),
                    spec.name.as_deref().unwrap_or(&args.name),
                )
            }
        }
    }

    /// Resolve a registration into a goal.
    pub fn prepare(&mut self, mut args: RegisterResource) -> Result<Prepared, RegistrationError> {
        self.apply_transforms(&mut args)?;
        self.check_parent(args.options.parent.as_ref(), &args.name)?;

        let urn = self.urn_for(args.options.parent.as_ref(), &args.ty, &args.name);
        let parent = args
            .options
            .parent
            .as_ref()
            .and_then(|parent| self.registered.get(parent));
        let mut diagnostics = Vec::new();

        if args.options.import_id.is_some() {
            if !args.custom || args.remote {
                return Err(RegistrationError::Unimportable {
                    urn,
                    reason: "components cannot be imported".to_string(),
                });
            }
            if is_provider_type(&args.ty) {
                return Err(RegistrationError::Unimportable {
                    urn,
                    reason: "provider resources cannot be imported".to_string(),
                });
            }
        }

        let protect = args
            .options
            .protect
            .unwrap_or_else(|| parent.is_some_and(|p| p.protect));

        let provider = if !args.custom || is_provider_type(&args.ty) {
            if args.options.provider.take().is_some() {
                diagnostics.push(Diagnostic::warning(
                    &urn,
                    DiagnosticKind::InvalidOption,
                    "the provider option is ignored for components and provider resources",
                ));
            }
            None
        } else {
            let package = package_of(&args.ty);
            match args.options.provider.take() {
                Some(reference) if reference.package() == package => Some(reference),
                Some(reference) => {
                    diagnostics.push(Diagnostic::warning(
                        &urn,
                        DiagnosticKind::InvalidOption,
                        format!(
                            "provider {reference} manages package {}, not {package}; using the default provider",
                            reference.package()
                        ),
                    ));
                    None
                }
                None => parent
                    .and_then(|p| p.provider.clone())
                    .filter(|reference| reference.package() == package),
            }
        };

        if !args.custom && args.options.delete_before_replace.is_some() {
            diagnostics.push(Diagnostic::warning(
                &urn,
                DiagnosticKind::InvalidOption,
                "delete_before_replace has no effect on components",
            ));
            args.options.delete_before_replace = None;
        }

        let mut aliases: Vec<Urn> = Vec::new();
        for alias in &args.options.aliases {
            let resolved = self.resolve_alias(alias, &args);
            if resolved != urn && !aliases.contains(&resolved) {
                aliases.push(resolved);
            }
        }

        self.registered.insert(
            urn.clone(),
            Registered {
                protect,
                provider: provider.clone(),
                transforms: args.options.transforms.clone(),
                parent: args.options.parent.clone(),
            },
        );

        let options = args.options;
        let goal = Goal {
            urn,
            ty: args.ty,
            name: args.name,
            custom: args.custom,
            remote: args.remote,
            inputs: args.inputs,
            parent: options.parent,
            protect,
            dependencies: options.dependencies,
            property_dependencies: options.property_dependencies,
            provider,
            version: options.version,
            delete_before_replace: options.delete_before_replace,
            retain_on_delete: options.retain_on_delete,
            ignore_changes: options.ignore_changes,
            replace_on_changes: options.replace_on_changes,
            additional_secret_outputs: options.additional_secret_outputs,
            custom_timeouts: options.custom_timeouts,
            aliases,
            import_id: options.import_id,
        };
        Ok(Prepared { goal, diagnostics })
    }

    /// Record the provider a resource ended up with, so children inherit it.
    pub fn set_provider(&mut self, urn: &Urn, provider: ProviderRef) {
        if let Some(registered) = self.registered.get_mut(urn) {
            registered.provider = Some(provider);
        }
    }

    /// Resolve a read request.
    pub fn prepare_read(&mut self, args: ReadResource) -> Result<ReadGoal, RegistrationError> {
        self.check_parent(args.parent.as_ref(), &args.name)?;
        if args.id.is_empty() {
            return Err(RegistrationError::Invalid {
                name: args.name,
                message: "an ID is required to read a resource".to_string(),
            });
        }
        let urn = self.urn_for(args.parent.as_ref(), &args.ty, &args.name);
        let package = package_of(&args.ty);
        let provider = args.provider.filter(|r| r.package() == package).or_else(|| {
            args.parent
                .as_ref()
                .and_then(|parent| self.registered.get(parent))
                .and_then(|p| p.provider.clone())
                .filter(|r| r.package() == package)
        });
        self.registered.insert(
            urn.clone(),
            Registered {
                protect: false,
                provider: provider.clone(),
                transforms: Vec::new(),
                parent: args.parent.clone(),
            },
        );
        Ok(ReadGoal {
            urn,
            ty: args.ty,
            id: args.id,
            inputs: args.inputs,
            parent: args.parent,
            provider,
            dependencies: args.dependencies,
            version: args.version,
        })
    }

    /// Register a URN produced outside of intake, such as a constructed component.
    pub fn note_external(&mut self, urn: &Urn, parent: Option<&Urn>) {
        self.registered.entry(urn.clone()).or_insert_with(|| Registered {
            protect: false,
            provider: None,
            transforms: Vec::new(),
            parent: parent.cloned(),
        });
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    pub fn project(&self) -> &str {
        &self.project
    }
}
