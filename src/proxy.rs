//! Remote-object handles.
//!
//! Rather than dynamic attribute interception (`__getattr__`-style magic),
//! [`ProxyObject`] is an opaque handle exposing `get_attr`/`call`/`invoke`/
//! `list_attrs` methods directly. Each method builds a script via the
//! service's bound [`ScriptSyntax`], runs it as a task, and returns the
//! `"result"` output, or surfaces the task's failure as
//! [`ProxyError::RemoteInvocation`].

use crate::error::ProxyError;
use crate::service::{pack_args, Service};
use crate::value::{Args, Value};

/// A local handle to a value living in the worker process, bound to the
/// name under which it was exported via `task.export(...)`.
///
/// Two `ProxyObject`s are equal iff they reference the same variable on the
/// same service, independent of any in-flight task state.
#[derive(Debug)]
pub struct ProxyObject {
    service: Service,
    var: String,
    queue: Option<String>,
}

impl ProxyObject {
    pub(crate) fn new(service: Service, var: String, queue: Option<String>) -> Self {
        Self { service, var, queue }
    }

    /// The exported variable name this proxy forwards to.
    pub fn var(&self) -> &str {
        &self.var
    }

    /// Forward `proxy.name` as `syntax.get_attribute(var, name)`.
    pub async fn get_attr(&self, name: &str) -> Result<Value, ProxyError> {
        let syntax = self.syntax()?;
        let script = syntax.get_attribute(&self.var, name);
        self.run(script, Args::new(), name).await
    }

    /// Forward calling the proxy itself as `syntax.call(var, [arg0…])`.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, ProxyError> {
        let syntax = self.syntax()?;
        let (inputs, arg_names) = pack_args(args);
        let script = syntax.call(&self.var, &arg_names);
        self.run(script, inputs, "__call__").await
    }

    /// Forward `proxy.method(args…)` as
    /// `syntax.invoke_method(var, method, [arg0…])`.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ProxyError> {
        let syntax = self.syntax()?;
        let (inputs, arg_names) = pack_args(args);
        let script = syntax.invoke_method(&self.var, method, &arg_names);
        self.run(script, inputs, method).await
    }

    /// List the remote object's attribute names, via
    /// `syntax.get_attributes(var)`.
    pub async fn list_attrs(&self) -> Result<Vec<String>, ProxyError> {
        let syntax = self.syntax()?;
        let script = syntax.get_attributes(&self.var);
        let result = self.run(script, Args::new(), "__dir__").await?;
        Ok(match result {
            Value::List(items) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        })
    }

    fn syntax(&self) -> Result<std::sync::Arc<dyn crate::syntax::ScriptSyntax>, ProxyError> {
        self.service.syntax().ok_or(ProxyError::NoSyntax)
    }

    async fn run(&self, script: String, inputs: Args, member: &str) -> Result<Value, ProxyError> {
        let task = self.service.task(script, inputs, self.queue.clone()).await?;
        let outputs = task
            .result()
            .await
            .map_err(|source| ProxyError::remote_invocation(self.var.clone(), member.to_string(), source))?;
        Ok(outputs.get("result").cloned().unwrap_or(Value::Null))
    }
}

impl PartialEq for ProxyObject {
    fn eq(&self, other: &Self) -> bool {
        self.service.id() == other.service.id() && self.var == other.var
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Service;

    #[tokio::test]
    async fn get_attr_without_syntax_fails() {
        let service = Service::new(".", vec!["true".to_string()]);
        let proxy = ProxyObject::new(service, "obj".to_string(), None);
        let err = proxy.get_attr("year").await.unwrap_err();
        assert!(matches!(err, ProxyError::NoSyntax));
    }

    #[test]
    fn equality_is_by_service_and_var() {
        let a = Service::new(".", vec!["true".to_string()]);
        let b = a.clone();
        let p1 = ProxyObject::new(a, "obj".to_string(), None);
        let p2 = ProxyObject::new(b, "obj".to_string(), None);
        assert_eq!(p1, p2);

        let other_service = Service::new(".", vec!["true".to_string()]);
        let p3 = ProxyObject::new(other_service, "obj".to_string(), None);
        assert_ne!(p1, p3);
    }
}
