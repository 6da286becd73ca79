//! Pluggable per-language script-text emitters.
//!
//! A [`ScriptSyntax`] translates the handful of operations the service and
//! proxy types need into script text for a specific guest language: reading
//! and writing a variable, calling a function, getting/invoking an
//! attribute, and listing an object's attributes. `get_attribute` and
//! `get_attributes` exist as explicit methods rather than relying on dynamic
//! attribute interception, since Rust has no `__getattr__`/`dir()` analogue
//! to lean on for a statically-dispatched proxy.

/// Strategy for generating language-specific script text. One implementation
/// per guest language; additional languages plug in by implementing this
/// trait.
pub trait ScriptSyntax: std::fmt::Debug + Send + Sync {
    /// Name of this syntax, e.g. `"python"` or `"groovy"`.
    fn name(&self) -> &'static str;

    /// An expression whose evaluation is the value of `name`. The variable
    /// must have been previously exported via `task.export()`.
    fn get_var(&self, name: &str) -> String;

    /// Statements that assign the input variable named `value_var` into
    /// `name` and export it for future tasks.
    fn put_var(&self, name: &str, value_var: &str) -> String;

    /// An expression invoking `function` with the named input variables as
    /// positional arguments.
    fn call(&self, function: &str, arg_vars: &[String]) -> String;

    /// An expression returning `obj.attr`.
    fn get_attribute(&self, obj: &str, attr: &str) -> String;

    /// An expression invoking `obj.method(args...)`.
    fn invoke_method(&self, obj: &str, method: &str, arg_vars: &[String]) -> String;

    /// An expression returning a listing of attribute names on `obj`, for
    /// introspection (the proxy's `list_attrs`).
    fn get_attributes(&self, obj: &str) -> String;
}

/// Python script syntax: `x.y` attribute access, `export(x=x)` keyword-style
/// export. Used automatically for services speaking to a Python worker.
#[derive(Debug, Default)]
pub struct PythonSyntax;

impl ScriptSyntax for PythonSyntax {
    fn name(&self) -> &'static str {
        "python"
    }

    fn get_var(&self, name: &str) -> String {
        name.to_string()
    }

    fn put_var(&self, name: &str, value_var: &str) -> String {
        format!("{name} = {value_var}\ntask.export({name}={name})")
    }

    fn call(&self, function: &str, arg_vars: &[String]) -> String {
        format!("{function}({})", arg_vars.join(", "))
    }

    fn get_attribute(&self, obj: &str, attr: &str) -> String {
        format!("{obj}.{attr}")
    }

    fn invoke_method(&self, obj: &str, method: &str, arg_vars: &[String]) -> String {
        format!("{obj}.{method}({})", arg_vars.join(", "))
    }

    fn get_attributes(&self, obj: &str) -> String {
        format!("[a for a in dir({obj}) if not a.startswith('_')]")
    }
}

/// Groovy script syntax: `x.y` attribute access, `[x: x]` map-literal
/// export (Groovy's `export(Map)` overload).
#[derive(Debug, Default)]
pub struct GroovySyntax;

impl ScriptSyntax for GroovySyntax {
    fn name(&self) -> &'static str {
        "groovy"
    }

    fn get_var(&self, name: &str) -> String {
        name.to_string()
    }

    fn put_var(&self, name: &str, value_var: &str) -> String {
        format!("{name} = {value_var}\ntask.export([{name}: {name}])")
    }

    fn call(&self, function: &str, arg_vars: &[String]) -> String {
        format!("{function}({})", arg_vars.join(", "))
    }

    fn get_attribute(&self, obj: &str, attr: &str) -> String {
        format!("{obj}.{attr}")
    }

    fn invoke_method(&self, obj: &str, method: &str, arg_vars: &[String]) -> String {
        format!("{obj}.{method}({})", arg_vars.join(", "))
    }

    fn get_attributes(&self, obj: &str) -> String {
        format!("{obj}.metaClass.properties*.name")
    }
}

/// Looks up a built-in syntax by name (`"python"` or `"groovy"`), mirroring
/// `appose.syntax.get`.
pub fn by_name(name: &str) -> Option<Box<dyn ScriptSyntax>> {
    match name {
        "python" => Some(Box::new(PythonSyntax)),
        "groovy" => Some(Box::new(GroovySyntax)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_put_var_assigns_and_exports() {
        let s = PythonSyntax;
        assert_eq!(
            s.put_var("age", "_value"),
            "age = _value\ntask.export(age=age)"
        );
    }

    #[test]
    fn python_call_joins_arg_names() {
        let s = PythonSyntax;
        assert_eq!(
            s.call("sqrt_age", &["arg0".to_string()]),
            "sqrt_age(arg0)"
        );
    }

    #[test]
    fn groovy_put_var_uses_map_literal() {
        let s = GroovySyntax;
        assert_eq!(
            s.put_var("age", "_value"),
            "age = _value\ntask.export([age: age])"
        );
    }

    #[test]
    fn invoke_method_matches_dotted_call_shape() {
        let s = PythonSyntax;
        assert_eq!(
            s.invoke_method("calc", "add", &["arg0".to_string(), "arg1".to_string()]),
            "calc.add(arg0, arg1)"
        );
    }

    #[test]
    fn by_name_resolves_known_syntaxes() {
        assert_eq!(by_name("python").unwrap().name(), "python");
        assert_eq!(by_name("groovy").unwrap().name(), "groovy");
        assert!(by_name("ruby").is_none());
    }
}
