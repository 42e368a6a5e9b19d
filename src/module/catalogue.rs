//! Process-wide catalogue of negotiation modules.
//!
//! Built-in modules are present from the start; applications may add their
//! own with [`register_module`]. Each connection attempt takes a snapshot when
//! it starts, so changes only affect later attempts.

use std::sync::{OnceLock, PoisonError, RwLock};

use tracing::debug;

use super::{bind, sasl, sm, starttls, ModuleCategory, ModuleDescriptor};

static CATALOGUE: OnceLock<RwLock<Vec<ModuleDescriptor>>> = OnceLock::new();

fn builtin_modules() -> Vec<ModuleDescriptor> {
    vec![
        ModuleDescriptor {
            name: starttls::NAME,
            category: ModuleCategory::Security,
            priority: 100,
            factory: starttls::create,
        },
        ModuleDescriptor {
            name: sasl::SCRAM_SHA_256,
            category: ModuleCategory::Authentication,
            priority: 300,
            factory: sasl::create_scram_sha_256,
        },
        ModuleDescriptor {
            name: sasl::PLAIN,
            category: ModuleCategory::Authentication,
            priority: 200,
            factory: sasl::create_plain,
        },
        ModuleDescriptor {
            name: sasl::ANONYMOUS,
            category: ModuleCategory::Authentication,
            priority: 100,
            factory: sasl::create_anonymous,
        },
        ModuleDescriptor {
            name: sm::RESUME,
            category: ModuleCategory::Binding,
            priority: 200,
            factory: sm::create_resume,
        },
        ModuleDescriptor {
            name: bind::RESOURCE_BIND,
            category: ModuleCategory::Binding,
            priority: 100,
            factory: bind::create_resource_bind,
        },
        ModuleDescriptor {
            name: bind::LEGACY_SESSION,
            category: ModuleCategory::Binding,
            priority: 50,
            factory: bind::create_legacy_session,
        },
        ModuleDescriptor {
            name: sm::ENABLE,
            category: ModuleCategory::PostAuth,
            priority: 100,
            factory: sm::create_enable,
        },
    ]
}

fn catalogue() -> &'static RwLock<Vec<ModuleDescriptor>> {
    CATALOGUE.get_or_init(|| RwLock::new(builtin_modules()))
}

/// Add a module. Returns false if one with the same name is already present.
pub fn register_module(descriptor: ModuleDescriptor) -> bool {
    let mut modules = catalogue().write().unwrap_or_else(PoisonError::into_inner);
    if modules.iter().any(|m| m.name == descriptor.name) {
        return false;
    }
    debug!(module = descriptor.name, category = ?descriptor.category, "Module registered");
    modules.push(descriptor);
    true
}

/// Snapshot of the catalogue in registration order.
pub fn registered_modules() -> Vec<ModuleDescriptor> {
    catalogue()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Activation order: by category, then priority (highest first), then
/// registration order. Modules named in `disabled` are left out.
pub(crate) fn activation_order(
    modules: Vec<ModuleDescriptor>,
    disabled: &[String],
) -> Vec<ModuleDescriptor> {
    let mut ordered: Vec<ModuleDescriptor> = modules
        .into_iter()
        .filter(|m| !disabled.iter().any(|d| d == m.name))
        .collect();
    // Stable, so equal keys stay in registration order
    ordered.sort_by_key(|m| (m.category, std::cmp::Reverse(m.priority)));
    ordered
}
