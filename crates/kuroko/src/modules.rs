//! Module loading: recursive dotted-name resolution over the search roots
//! in `kuroko.module_paths`.
//!
//! `import a.b.c` loads `a`, then `a.b`, then `a.b.c`, registering each in
//! the VM module table and binding each child as an attribute of its
//! parent. Packages are directories with an `__init__.krk`; plain modules
//! are `<name>.krk` files. A module is registered *before* its body runs so
//! import cycles resolve to the partially initialized module instead of
//! recursing forever.

use std::path::PathBuf;

use crate::{
    compile::Compiler,
    exception::{ExcType, RunResult},
    heap::{HeapData, HeapId},
    value::Value,
    vm::Vm,
};

/// Loads a dotted module path, returning the leaf module instance.
pub(crate) fn import_module(vm: &mut Vm, dotted: &str) -> RunResult<Value> {
    let mut parent: Option<HeapId> = None;
    let mut accumulated = String::new();
    for part in dotted.split('.') {
        if !accumulated.is_empty() {
            accumulated.push('.');
        }
        accumulated.push_str(part);
        let name_id = vm.heap.intern_string(&accumulated);
        if let Some(&existing) = vm.modules.get(&name_id) {
            parent = match existing {
                Value::Ref(id) => Some(id),
                _ => None,
            };
            continue;
        }
        let module = load_single_module(vm, &accumulated, name_id)?;
        if let Some(parent_id) = parent {
            let part_id = vm.heap.intern_string(part);
            if let HeapData::Instance(p) = vm.heap.get_mut(parent_id) {
                p.fields.insert(part_id, Value::Ref(module));
            }
        }
        parent = Some(module);
    }
    let leaf_id = vm.heap.intern_string(dotted);
    vm.modules
        .get(&leaf_id)
        .copied()
        .ok_or_else(|| ExcType::import_error(format!("no module named '{dotted}'")))
}

/// Locates, compiles, registers, and executes one module.
fn load_single_module(vm: &mut Vm, dotted: &str, name_id: HeapId) -> RunResult<HeapId> {
    let Some((path, source)) = locate_source(vm, dotted) else {
        return Err(ExcType::import_error(format!("no module named '{dotted}'")));
    };
    let filename = path.to_string_lossy().into_owned();
    let func = Compiler::compile(&mut vm.heap, &source, &filename).map_err(|e| {
        ExcType::import_error(format!(
            "syntax error in module '{dotted}': {} (line {})",
            e.message, e.line
        ))
    })?;
    let module = vm.new_module_instance(name_id);
    // Registered before execution so import cycles terminate.
    vm.modules.insert(name_id, Value::Ref(module));
    match vm.run_function(func, module) {
        Ok(_) => Ok(module),
        Err(err) => {
            vm.modules.shift_remove(&name_id);
            Err(err)
        }
    }
}

/// Searches `kuroko.module_paths` for `name.krk` or `name/__init__.krk`.
fn locate_source(vm: &Vm, dotted: &str) -> Option<(PathBuf, String)> {
    let relative = dotted.replace('.', "/");
    let roots = module_roots(vm);
    for root in roots {
        for candidate in [
            PathBuf::from(&root).join(format!("{relative}.krk")),
            PathBuf::from(&root).join(&relative).join("__init__.krk"),
        ] {
            if let Ok(source) = std::fs::read_to_string(&candidate) {
                return Some((candidate, source));
            }
        }
    }
    None
}

/// Current search roots; reads the live `kuroko.module_paths` list so
/// scripts can extend it.
fn module_roots(vm: &Vm) -> Vec<String> {
    let mut roots = Vec::new();
    if let HeapData::List(l) = vm.heap.get(vm.module_paths_list) {
        for &item in &l.items {
            if let Value::Ref(id) = item
                && let HeapData::Str(s) = vm.heap.get(id)
            {
                roots.push(s.as_str().to_owned());
            }
        }
    }
    if roots.is_empty() {
        roots.push(".".to_owned());
    }
    roots
}

impl Vm {
    /// `ImportFrom`: pops a module, pushes one of its attributes, loading a
    /// submodule on a miss.
    pub(crate) fn op_import_from(&mut self, name: HeapId) -> RunResult<()> {
        let module = self.pop();
        let Value::Ref(module_id) = module else {
            return Err(ExcType::import_error("cannot import from a non-module"));
        };
        if let HeapData::Instance(m) = self.heap.get(module_id)
            && let Some(&found) = m.fields.get(&name)
        {
            self.push(found);
            return Ok(());
        }
        // Attribute miss: try `package.name` as a submodule.
        let name_key = self.heap.intern_string("__name__");
        let package = match self.heap.get(module_id) {
            HeapData::Instance(m) => m.fields.get(&name_key).copied(),
            _ => None,
        };
        if let Some(Value::Ref(pkg_name_id)) = package
            && let HeapData::Str(pkg) = self.heap.get(pkg_name_id)
        {
            let dotted = format!("{}.{}", pkg.as_str(), self.heap.str_value(name));
            let value = import_module(self, &dotted)?;
            self.push(value);
            return Ok(());
        }
        Err(ExcType::import_error(format!(
            "cannot import name '{}'",
            self.heap.str_value(name)
        )))
    }
}
