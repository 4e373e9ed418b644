//! Modules implemented natively and reachable through `import`.

use std::rc::Rc;

use indexmap::IndexMap;

use super::builtins::module_builtins;
use super::value::{Module, ModuleAttrs, Value};

pub const NATIVE_MODULES: [&str; 3] = ["math", "needles", "carriers"];

/// Build a native module, or `None` when no module has that name.
pub fn native_module(name: &str) -> Option<Rc<Module>> {
    if !NATIVE_MODULES.contains(&name) {
        return None;
    }
    let mut attrs: IndexMap<String, Value> = module_builtins(name)
        .map(|b| (b.name.to_string(), Value::Builtin(b)))
        .collect();
    if name == "math" {
        attrs.insert("pi".into(), Value::Float(std::f64::consts::PI));
        attrs.insert("e".into(), Value::Float(std::f64::consts::E));
    }
    Some(Rc::new(Module {
        name: name.to_string(),
        attrs: ModuleAttrs::Native(attrs),
    }))
}

/// Wrap `inner` as attribute `child` of a package module, reusing the
/// entries of `existing` when the package was imported before.
pub fn package(name: &str, existing: Option<&Module>, child: &str, inner: Value) -> Rc<Module> {
    let mut attrs = match existing.map(|m| &m.attrs) {
        Some(ModuleAttrs::Native(map)) => map.clone(),
        Some(ModuleAttrs::Script(frame)) => frame
            .borrow()
            .names()
            .into_iter()
            .filter_map(|n| frame.borrow().get_own(&n).map(|v| (n, v)))
            .collect(),
        None => IndexMap::new(),
    };
    attrs.insert(child.to_string(), inner);
    Rc::new(Module {
        name: name.to_string(),
        attrs: ModuleAttrs::Native(attrs),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn math_has_constants_and_functions() {
        let math = native_module("math").unwrap();
        assert!(matches!(math.get("pi"), Some(Value::Float(_))));
        assert!(matches!(math.get("sqrt"), Some(Value::Builtin(_))));
        assert!(math.get("len").is_none());
    }

    #[test]
    fn unknown_modules_are_absent() {
        assert!(native_module("os").is_none());
    }

    #[test]
    fn packages_keep_earlier_children() {
        let first = package("lib", None, "a", Value::Int(1));
        let second = package("lib", Some(&first), "b", Value::Int(2));
        assert!(second.get("a").is_some());
        assert!(second.get("b").is_some());
    }
}
