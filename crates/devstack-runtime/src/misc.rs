//! Networks and secrets.

use std::path::Path;
use std::sync::Arc;

use devstack_common::types::Action;
use devstack_core::host::Host;

use crate::resource::{Attr, Resource, TemplateSet};

/// An engine network. Creation tolerates an existing network, so there is
/// no existence probe.
pub fn network(name: &str, host: Arc<dyn Host>) -> Resource {
    let engine = host.engine().to_string();
    let templates = TemplateSet::new()
        .with(
            Action::Create,
            [engine.as_str(), "network", "create", "--ignore", "{name}"],
        )
        .with(Action::Remove, [engine.as_str(), "network", "rm", "{name}"]);
    Resource::with_name("Network", name, templates, host)
}

/// An engine secret whose content is read from the file in `source`.
pub fn secret(name: &str, source: Attr, path: &Path, host: Arc<dyn Host>) -> Resource {
    let engine = host.engine().to_string();
    let templates = TemplateSet::new()
        .with_inspect([engine.as_str(), "secret", "inspect", "{name}"])
        .with(
            Action::Create,
            [engine.as_str(), "secret", "create", "{name}", source.placeholder()],
        )
        .with(Action::Remove, [engine.as_str(), "secret", "rm", "{name}"]);
    Resource::with_name("Secret", name, templates, host).attr(source, path.display().to_string())
}
