//! A resolved launch environment, bundling the command line a worker process
//! should be started with and the [`ScriptSyntax`] its guest language
//! expects.
//!
//! Building an environment *from* a declarative description — a Pixi/Mamba/uv
//! manifest, a downloaded interpreter archive — is out of scope here; this is
//! just the thin handoff point those builders would target: given a resolved
//! base directory and command, produce bound [`Service`]s.

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::service::Service;
use crate::syntax;

/// A resolved command line plus the script syntax its guest language
/// expects, bundled for repeated [`Service`] construction.
#[derive(Debug, Clone)]
pub struct Environment {
    pub base: PathBuf,
    pub command: Vec<String>,
    syntax_name: Option<String>,
}

impl Environment {
    /// A bare environment with no bound syntax; scripts run through it must
    /// be written directly against the worker's engine.
    pub fn new(base: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            base: base.into(),
            command,
            syntax_name: None,
        }
    }

    /// A `python <args…>`-style environment, bound to [`syntax::PythonSyntax`].
    pub fn python(base: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let mut command = vec!["python".to_string()];
        command.extend(args);
        Self::new(base, command).with_syntax("python")
    }

    /// A `groovy <args…>`-style environment, bound to [`syntax::GroovySyntax`].
    pub fn groovy(base: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let mut command = vec!["groovy".to_string()];
        command.extend(args);
        Self::new(base, command).with_syntax("groovy")
    }

    /// Bind a named syntax (see [`syntax::by_name`]) to services built from
    /// this environment. Unknown names are silently ignored at `service()`
    /// time rather than here, matching [`syntax::by_name`]'s own fallibility.
    pub fn with_syntax(mut self, name: impl Into<String>) -> Self {
        self.syntax_name = Some(name.into());
        self
    }

    /// Build a [`Service`] bound to this environment's command/cwd, with
    /// default timings.
    pub fn service(&self) -> Service {
        self.service_with_config(ServiceConfig::default())
    }

    /// As [`Environment::service`], with explicit [`ServiceConfig`] timings.
    pub fn service_with_config(&self, config: ServiceConfig) -> Service {
        let service = Service::with_config(self.base.clone(), self.command.clone(), config);
        if let Some(name) = &self.syntax_name {
            if let Some(s) = syntax::by_name(name) {
                let s: Arc<dyn syntax::ScriptSyntax> = Arc::from(s);
                service.set_syntax(s);
            }
        }
        service
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_environment_binds_python_syntax() {
        let env = Environment::python(".", vec!["-u".to_string(), "worker.py".to_string()]);
        let service = env.service();
        assert_eq!(service.syntax().map(|s| s.name()), Some("python"));
    }

    #[test]
    fn bare_environment_has_no_syntax() {
        let env = Environment::new(".", vec!["true".to_string()]);
        let service = env.service();
        assert!(service.syntax().is_none());
    }

    #[test]
    fn groovy_environment_binds_groovy_syntax() {
        let env = Environment::groovy(".", vec!["worker.groovy".to_string()]);
        let service = env.service();
        assert_eq!(service.syntax().map(|s| s.name()), Some("groovy"));
    }
}
