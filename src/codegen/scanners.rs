//! Per-type C definitions: struct layout, field-aware scanner and release
//! function for every registered type.

use super::mangle;
use crate::types::{FieldDef, FieldStrength, TypeDef, TypeRegistry, is_scalar_type};
use std::fmt::Write;

enum FieldKind<'a> {
    Scalar,
    /// Pointer to another registered type
    Record(&'a TypeDef),
    /// Anything else is a runtime cell
    Cell,
}

fn field_kind<'a>(registry: &'a TypeRegistry, field: &FieldDef) -> FieldKind<'a> {
    if is_scalar_type(&field.type_name) {
        return FieldKind::Scalar;
    }
    match registry.get(&field.type_name) {
        Some(def) => FieldKind::Record(def),
        None => FieldKind::Cell,
    }
}

fn field_decl(registry: &TypeRegistry, field: &FieldDef) -> String {
    let name = mangle(&field.name);
    if field.is_weak() {
        return format!("WeakRef* {name};");
    }
    let decl = match field_kind(registry, field) {
        FieldKind::Scalar => format!("long {name};"),
        FieldKind::Record(def) => format!("struct {}* {name};", mangle(&def.name)),
        FieldKind::Cell => format!("Obj* {name};"),
    };
    if field.strength == FieldStrength::Untraced {
        return format!("{decl} /* untraced */");
    }
    decl
}

fn emit_struct(out: &mut String, registry: &TypeRegistry, def: &TypeDef) {
    let c_name = mangle(&def.name);
    let _ = writeln!(out, "struct {c_name} {{");
    for field in &def.fields {
        let _ = writeln!(out, "    {}", field_decl(registry, field));
    }
    let _ = writeln!(out, "    int mark;\n}};\n");
}

fn emit_scanner(out: &mut String, registry: &TypeRegistry, def: &TypeDef) {
    let c_name = mangle(&def.name);
    let _ = writeln!(out, "static void* scan_{c_name}(void* p) {{");
    let _ = writeln!(out, "    {c_name}* x = p;");
    let _ = writeln!(out, "    if (!x || x->mark) return p;");
    let _ = writeln!(out, "    x->mark = 1;");
    for field in &def.fields {
        let name = mangle(&field.name);
        if field.is_weak() {
            let _ = writeln!(out, "    /* {}: weak, skipped */", field.name);
            continue;
        }
        if !field.is_traced() {
            continue;
        }
        match field_kind(registry, field) {
            FieldKind::Record(target) => {
                let _ = writeln!(out, "    scan_{}(x->{name});", mangle(&target.name));
            }
            FieldKind::Cell => {
                let _ = writeln!(out, "    scan_obj(x->{name});");
            }
            FieldKind::Scalar => {}
        }
    }
    let _ = writeln!(out, "    x->mark = 0;\n    return p;\n}}\n");
}

fn emit_release(out: &mut String, registry: &TypeRegistry, def: &TypeDef) {
    let c_name = mangle(&def.name);
    let _ = writeln!(out, "static void release_{c_name}({c_name}* x) {{");
    let _ = writeln!(out, "    if (!x) return;");
    // weak edges are invalidated before any strong child goes away
    for field in def.weak_fields() {
        let _ = writeln!(out, "    invalidate_weak(x->{});", mangle(&field.name));
    }
    for field in def.fields.iter().filter(|f| f.is_traced()) {
        let name = mangle(&field.name);
        match field_kind(registry, field) {
            FieldKind::Record(target) => {
                let _ = writeln!(out, "    release_{}(x->{name});", mangle(&target.name));
            }
            FieldKind::Cell => {
                let _ = writeln!(out, "    dec_ref(x->{name});");
            }
            FieldKind::Scalar => {}
        }
    }
    let _ = writeln!(out, "    free(x);\n}}\n");
}

/// Struct definitions, scanners and release functions for every type.
/// Forward declarations come first so types may refer to each other.
pub fn emit_type_definitions(registry: &TypeRegistry) -> String {
    let mut out = String::new();
    if registry.is_empty() {
        return out;
    }
    out.push_str("\n/* Registered types */\n");
    for def in registry.types() {
        let c_name = mangle(&def.name);
        let _ = writeln!(out, "typedef struct {c_name} {c_name};");
    }
    out.push('\n');
    for def in registry.types() {
        emit_struct(&mut out, registry, def);
    }
    for def in registry.types() {
        let c_name = mangle(&def.name);
        let _ = writeln!(out, "static void* scan_{c_name}(void* p);");
        let _ = writeln!(out, "static void release_{c_name}({c_name}* x);");
    }
    out.push('\n');
    for def in registry.types() {
        emit_scanner(&mut out, registry, def);
        emit_release(&mut out, registry, def);
    }
    tracing::debug!(types = registry.types().len(), "emitted type definitions");
    out
}
