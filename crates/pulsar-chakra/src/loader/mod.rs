//! Runtime-loader interface.
//!
//! The loader owns the handle model the emitter writes into the code stream:
//! interned string literals, imported runtime types/fields/helper methods,
//! and the routines defined by a compilation. A [`Module`] may serve several
//! sequential compilations; its tables are guarded so the host can share one
//! module handle with a single writer at a time.

pub mod signature;
pub mod token;

pub use token::{FieldRef, MethodRef, Token, TokenTable, TypeRef};

use crate::compiler::emitter::CompletedCode;
use crate::compiler::{disasm, ValueKind};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A compiled, loadable routine.
///
/// The calling convention is `(scope, this, …userArgs) → value`: argument 0
/// is the current-scope handle and argument 1 the `this` receiver.
#[derive(Debug, Clone)]
pub struct Routine {
    /// Routine name (`<global>` for program code).
    pub name: String,
    /// The token naming this routine within its module.
    pub token: Token,
    /// Number of user parameters, excluding the scope and `this` arguments.
    pub param_count: u16,
    /// Maximum evaluation-stack depth the code can reach.
    pub max_stack: u32,
    /// The instruction stream.
    pub code: Vec<u8>,
    /// Local-variable signature blob.
    pub local_signature: Vec<u8>,
    /// Serialized exception-handling table; empty when the routine has no
    /// protected regions.
    pub exception_table: Vec<u8>,
    /// Number of inline property-cache sites the runtime must allocate
    /// (two cells each).
    pub cache_sites: u32,
}

impl fmt::Display for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            ".routine {} ({} args, maxstack {}, {} bytes)",
            self.name,
            self.param_count,
            self.max_stack,
            self.code.len()
        )?;
        match disasm::disassemble(&self.code) {
            Ok(listing) => {
                for inst in &listing {
                    writeln!(f, "  {}", inst)?;
                }
            }
            Err(err) => writeln!(f, "  <undecodable: {}>", err)?,
        }
        Ok(())
    }
}

/// Well-known runtime types, fields, and helper methods the code generator
/// targets. Interned once per module.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct WellKnown {
    // Types
    pub type_number: TypeRef,
    pub type_boolean: TypeRef,
    pub type_value: TypeRef,
    pub type_error: TypeRef,

    // Fields
    pub global_instance: FieldRef,
    pub undefined_value: FieldRef,

    // Scope construction and access
    pub create_declarative_scope: MethodRef,
    pub create_object_scope: MethodRef,
    pub scope_parent: MethodRef,
    pub scope_get_slot: MethodRef,
    pub scope_set_slot: MethodRef,
    pub scope_binding_object: MethodRef,
    pub scope_has_property: MethodRef,
    pub scope_get_property: MethodRef,
    pub scope_set_property_if_exists: MethodRef,
    pub scope_set_property: MethodRef,

    // Coercions
    pub to_object: MethodRef,
    pub to_number: MethodRef,
    pub to_int32: MethodRef,
    pub to_boolean: MethodRef,

    // Operators on boxed values
    pub add_values: MethodRef,
    pub loose_equals: MethodRef,
    pub strict_equals: MethodRef,
    pub compare_less: MethodRef,
    pub compare_less_equal: MethodRef,
    pub compare_greater: MethodRef,
    pub compare_greater_equal: MethodRef,
    pub typeof_value: MethodRef,
    pub delete_member: MethodRef,

    // Property protocol
    pub get_member: MethodRef,
    pub set_member: MethodRef,
    pub get_index: MethodRef,
    pub set_index: MethodRef,

    // Invocation
    pub call_value: MethodRef,
    pub construct: MethodRef,
    pub create_closure: MethodRef,

    // Literals and control support
    pub new_plain_object: MethodRef,
    pub make_array: MethodRef,
    pub make_switch_index: MethodRef,
    pub create_reference_error: MethodRef,
}

#[derive(Debug, Default)]
struct Tables {
    strings: Vec<String>,
    string_index: FxHashMap<String, u32>,
    types: Vec<TypeRef>,
    fields: Vec<FieldRef>,
    members: Vec<MethodRef>,
    routines: Vec<Arc<Routine>>,
}

impl Tables {
    fn type_ref(&mut self, name: &str) -> TypeRef {
        let token = Token::new(TokenTable::TypeRef, self.types.len() as u32);
        let ty = TypeRef {
            token,
            name: name.to_string(),
        };
        self.types.push(ty.clone());
        ty
    }

    fn field_ref(&mut self, name: &str, kind: ValueKind, is_static: bool) -> FieldRef {
        let token = Token::new(TokenTable::Field, self.fields.len() as u32);
        let field = FieldRef {
            token,
            name: name.to_string(),
            kind,
            is_static,
        };
        self.fields.push(field.clone());
        field
    }

    fn method_ref(
        &mut self,
        name: &str,
        params: &[ValueKind],
        return_kind: Option<ValueKind>,
    ) -> MethodRef {
        let token = Token::new(TokenTable::MemberRef, self.members.len() as u32);
        let method = MethodRef {
            token,
            name: name.to_string(),
            params: params.to_vec(),
            return_kind,
            is_static: true,
        };
        self.members.push(method.clone());
        method
    }
}

/// A runtime-loader module: the shared target of one or more compilations.
#[derive(Debug)]
pub struct Module {
    tables: RwLock<Tables>,
    well_known: WellKnown,
}

impl Module {
    /// Creates a fresh module with the well-known runtime imports interned.
    pub fn new() -> Arc<Module> {
        use ValueKind::{Float, Int32, Object};

        let mut t = Tables::default();
        let well_known = WellKnown {
            type_number: t.type_ref("Number"),
            type_boolean: t.type_ref("Boolean"),
            type_value: t.type_ref("Value"),
            type_error: t.type_ref("JsError"),

            global_instance: t.field_ref("global_instance", Object, true),
            undefined_value: t.field_ref("undefined_value", Object, true),

            create_declarative_scope: t.method_ref(
                "create_declarative_scope",
                &[Object, Int32],
                Some(Object),
            ),
            create_object_scope: t.method_ref(
                "create_object_scope",
                &[Object, Object],
                Some(Object),
            ),
            scope_parent: t.method_ref("scope_parent", &[Object], Some(Object)),
            scope_get_slot: t.method_ref("scope_get_slot", &[Object, Int32], Some(Object)),
            scope_set_slot: t.method_ref("scope_set_slot", &[Object, Int32, Object], None),
            scope_binding_object: t.method_ref("scope_binding_object", &[Object], Some(Object)),
            scope_has_property: t.method_ref(
                "scope_has_property",
                &[Object, Object, Int32],
                Some(Int32),
            ),
            scope_get_property: t.method_ref(
                "scope_get_property",
                &[Object, Object, Int32],
                Some(Object),
            ),
            scope_set_property_if_exists: t.method_ref(
                "scope_set_property_if_exists",
                &[Object, Object, Object, Int32],
                Some(Int32),
            ),
            scope_set_property: t.method_ref(
                "scope_set_property",
                &[Object, Object, Object, Int32],
                None,
            ),

            to_object: t.method_ref("to_object", &[Object], Some(Object)),
            to_number: t.method_ref("to_number", &[Object], Some(Float)),
            to_int32: t.method_ref("to_int32", &[Object], Some(Int32)),
            to_boolean: t.method_ref("to_boolean", &[Object], Some(Int32)),

            add_values: t.method_ref("add_values", &[Object, Object], Some(Object)),
            loose_equals: t.method_ref("loose_equals", &[Object, Object], Some(Int32)),
            strict_equals: t.method_ref("strict_equals", &[Object, Object], Some(Int32)),
            compare_less: t.method_ref("compare_less", &[Object, Object], Some(Int32)),
            compare_less_equal: t.method_ref("compare_less_equal", &[Object, Object], Some(Int32)),
            compare_greater: t.method_ref("compare_greater", &[Object, Object], Some(Int32)),
            compare_greater_equal: t.method_ref(
                "compare_greater_equal",
                &[Object, Object],
                Some(Int32),
            ),
            typeof_value: t.method_ref("typeof_value", &[Object], Some(Object)),
            delete_member: t.method_ref("delete_member", &[Object, Object], Some(Int32)),

            get_member: t.method_ref("get_member", &[Object, Object, Int32], Some(Object)),
            set_member: t.method_ref("set_member", &[Object, Object, Object, Int32], None),
            get_index: t.method_ref("get_index", &[Object, Object], Some(Object)),
            set_index: t.method_ref("set_index", &[Object, Object, Object], None),

            call_value: t.method_ref("call_value", &[Object, Object, Object], Some(Object)),
            construct: t.method_ref("construct", &[Object, Object], Some(Object)),
            create_closure: t.method_ref("create_closure", &[Object, Int32], Some(Object)),

            new_plain_object: t.method_ref("new_plain_object", &[], Some(Object)),
            make_array: t.method_ref("make_array", &[Object], Some(Object)),
            make_switch_index: t.method_ref(
                "make_switch_index",
                &[Object, Int32, Int32],
                Some(Int32),
            ),
            create_reference_error: t.method_ref(
                "create_reference_error",
                &[Object],
                Some(Object),
            ),
        };

        Arc::new(Module {
            tables: RwLock::new(t),
            well_known,
        })
    }

    /// The well-known runtime imports.
    pub fn well_known(&self) -> &WellKnown {
        &self.well_known
    }

    /// Interns a string literal and returns its token. Repeated interning of
    /// the same text yields the same token.
    pub fn intern_string(&self, text: &str) -> Token {
        let mut tables = self.tables.write();
        if let Some(&index) = tables.string_index.get(text) {
            return Token::new(TokenTable::String, index);
        }
        let index = tables.strings.len() as u32;
        tables.strings.push(text.to_string());
        tables.string_index.insert(text.to_string(), index);
        Token::new(TokenTable::String, index)
    }

    /// Resolves a string token minted by this module.
    pub fn string(&self, token: Token) -> Option<String> {
        if token.table() != Some(TokenTable::String) {
            return None;
        }
        let tables = self.tables.read();
        tables.strings.get(token.index() as usize - 1).cloned()
    }

    /// Imports a runtime type by name.
    pub fn type_ref(&self, name: &str) -> TypeRef {
        self.tables.write().type_ref(name)
    }

    /// Imports a runtime field.
    pub fn field_ref(&self, name: &str, kind: ValueKind, is_static: bool) -> FieldRef {
        self.tables.write().field_ref(name, kind, is_static)
    }

    /// Imports a static runtime helper method.
    pub fn method_ref(
        &self,
        name: &str,
        params: &[ValueKind],
        return_kind: Option<ValueKind>,
    ) -> MethodRef {
        self.tables.write().method_ref(name, params, return_kind)
    }

    /// Constructs an invocable routine from a finalized emitter payload and
    /// registers it in this module.
    pub fn define_routine(
        &self,
        name: &str,
        param_count: u16,
        completed: CompletedCode,
    ) -> Arc<Routine> {
        let mut tables = self.tables.write();
        let token = Token::new(TokenTable::Routine, tables.routines.len() as u32);
        let routine = Arc::new(Routine {
            name: name.to_string(),
            token,
            param_count,
            max_stack: completed.max_stack,
            code: completed.code,
            local_signature: completed.local_signature,
            exception_table: completed.exception_table,
            cache_sites: completed.cache_sites,
        });
        tables.routines.push(Arc::clone(&routine));
        debug!(
            name = routine.name.as_str(),
            token = %routine.token,
            code_len = routine.code.len(),
            max_stack = routine.max_stack,
            "routine loaded"
        );
        routine
    }

    /// Looks up a routine previously defined in this module.
    pub fn routine(&self, token: Token) -> Option<Arc<Routine>> {
        if token.table() != Some(TokenTable::Routine) {
            return None;
        }
        let tables = self.tables.read();
        tables.routines.get(token.index() as usize - 1).cloned()
    }
}
