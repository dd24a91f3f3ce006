use std::collections::{BTreeSet, HashMap};

use models::{StorageClass, Value};
use warren_sql::{StoredValue, Table};

use crate::error::{Error, Result};
use crate::Ctx;

/// The set of registered flag bits attached to a record.
pub type FlagSet = BTreeSet<u8>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SearchStrategy {
    Prefix,
    Phonetic,
}

/// Per-context metadata supplied at registration.
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    /// The context of the object this context attaches to through its
    /// `base_id`. Required for node, property, alias, name and
    /// relationship contexts.
    pub base_ctx: Option<Ctx>,
    /// For relationship contexts, the context of the `rel_id` end.
    pub rel_ctx: Option<Ctx>,
    /// Storage class of the value column pair; only meaningful for
    /// property and node contexts.
    pub storage: Option<StorageClass>,
    /// For `StorageClass::Serialized`, an optional JSON schema that values
    /// are validated against at the boundary.
    pub schema: Option<serde_json::Value>,
    /// For name contexts, how `search` behaves.
    pub search: Option<SearchStrategy>,
    /// For phonetic name contexts, also match on the double-metaphone
    /// alternate code.
    pub phonetic_loose: bool,
}

struct ContextEntry {
    kind: Table,
    config: ContextConfig,
    validator: Option<jsonschema::Validator>,
}

/// The runtime-configured catalogue of record shapes: context id to record
/// kind plus metadata, and the registered flag bits per context.
///
/// A catalog is built once at startup and frozen into the pool; lookups
/// never mutate it, so steady-state reads take no locks. Tests build their
/// own instances; nothing here is process-global.
#[derive(Default)]
pub struct Catalog {
    contexts: HashMap<Ctx, ContextEntry>,
    flags: HashMap<Ctx, HashMap<u8, String>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context id as holding records of `kind`.
    pub fn register_context(&mut self, ctx: Ctx, kind: Table, config: ContextConfig) -> Result<()> {
        if self.contexts.contains_key(&ctx) {
            return Err(Error::Config(format!("duplicate context value {ctx}")));
        }
        if kind == Table::Entity && config.base_ctx.is_some() {
            return Err(Error::IsRoot(ctx));
        }
        if let Some(base_ctx) = config.base_ctx {
            if !self.contexts.contains_key(&base_ctx) {
                return Err(Error::Config(format!(
                    "related base context {base_ctx} doesn't exist"
                )));
            }
        }
        if let Some(rel_ctx) = config.rel_ctx {
            if !self.contexts.contains_key(&rel_ctx) {
                return Err(Error::Config(format!(
                    "related rel context {rel_ctx} doesn't exist"
                )));
            }
        }

        let validator = match &config.schema {
            None => None,
            Some(schema) => Some(jsonschema::validator_for(schema).map_err(|err| {
                Error::Config(format!("invalid schema for context {ctx}: {err}"))
            })?),
        };

        self.contexts.insert(
            ctx,
            ContextEntry {
                kind,
                config,
                validator,
            },
        );
        Ok(())
    }

    /// Register a flag bit (1..=16) as valid for a context.
    pub fn register_flag(&mut self, ctx: Ctx, bit: u8, name: &str) -> Result<()> {
        if !(1..=16).contains(&bit) {
            return Err(Error::Config(format!(
                "flag bit outside of range 1..=16: {bit}"
            )));
        }
        if !self.contexts.contains_key(&ctx) {
            return Err(Error::Config(format!("unrecognized context {ctx}")));
        }
        let flags = self.flags.entry(ctx).or_default();
        if flags.contains_key(&bit) {
            return Err(Error::Config(format!(
                "duplicate flag bit {bit} for context {ctx}"
            )));
        }
        flags.insert(bit, name.to_owned());
        Ok(())
    }

    pub fn kind(&self, ctx: Ctx) -> Option<Table> {
        self.contexts.get(&ctx).map(|e| e.kind)
    }

    /// Require that `ctx` is registered against `kind`.
    pub fn expect_kind(&self, ctx: Ctx, kind: Table) -> Result<()> {
        match self.kind(ctx) {
            Some(k) if k == kind => Ok(()),
            _ => Err(Error::BadContext(ctx)),
        }
    }

    pub fn base_ctx(&self, ctx: Ctx) -> Option<Ctx> {
        self.contexts.get(&ctx).and_then(|e| e.config.base_ctx)
    }

    /// `(table, context)` of a context's base object, for parent-existence
    /// predicates.
    pub fn base(&self, ctx: Ctx) -> Result<(Table, Ctx)> {
        let base_ctx = self.base_ctx(ctx).ok_or(Error::BadContext(ctx))?;
        let table = self.kind(base_ctx).ok_or(Error::BadContext(base_ctx))?;
        Ok((table, base_ctx))
    }

    pub fn rel_ctx(&self, ctx: Ctx) -> Option<Ctx> {
        self.contexts.get(&ctx).and_then(|e| e.config.rel_ctx)
    }

    /// `(table, context)` of a relationship context's `rel_id` end.
    pub fn rel(&self, ctx: Ctx) -> Result<(Table, Ctx)> {
        let rel_ctx = self.rel_ctx(ctx).ok_or(Error::BadContext(ctx))?;
        let table = self.kind(rel_ctx).ok_or(Error::BadContext(rel_ctx))?;
        Ok((table, rel_ctx))
    }

    pub fn storage(&self, ctx: Ctx) -> StorageClass {
        self.contexts
            .get(&ctx)
            .and_then(|e| e.config.storage)
            .unwrap_or(StorageClass::Null)
    }

    pub fn search(&self, ctx: Ctx) -> Option<SearchStrategy> {
        self.contexts.get(&ctx).and_then(|e| e.config.search)
    }

    pub fn phonetic_loose(&self, ctx: Ctx) -> bool {
        self.contexts
            .get(&ctx)
            .map(|e| e.config.phonetic_loose)
            .unwrap_or(false)
    }

    /// Convert an iterable of flag bits to the stored bitmap, rejecting
    /// bits not registered for this context.
    pub fn flags_to_bits(&self, ctx: Ctx, flags: &[u8]) -> Result<i32> {
        if !self.contexts.contains_key(&ctx) {
            return Err(Error::BadContext(ctx));
        }
        let registered = self.flags.get(&ctx);
        let mut bits = 0i32;
        for &bit in flags {
            if !registered.is_some_and(|f| f.contains_key(&bit)) {
                return Err(Error::BadFlag { ctx, bit });
            }
            bits |= 1 << (bit - 1);
        }
        Ok(bits)
    }

    /// Convert a stored bitmap back to the set of registered flag bits;
    /// unregistered bits are dropped silently, matching reads of rows
    /// written under a wider registry.
    pub fn bits_to_flags(&self, ctx: Ctx, mut bits: i32) -> FlagSet {
        let registered = self.flags.get(&ctx);
        let mut set = FlagSet::new();
        let mut bit = 1u8;
        while bits != 0 && bit <= 16 {
            if bits & 1 == 1 && registered.is_some_and(|f| f.contains_key(&bit)) {
                set.insert(bit);
            }
            bits >>= 1;
            bit += 1;
        }
        set
    }

    pub fn flag_name(&self, ctx: Ctx, bit: u8) -> Option<&str> {
        self.flags
            .get(&ctx)
            .and_then(|f| f.get(&bit))
            .map(String::as_str)
    }

    /// Wrap a runtime value into the `(num, value)` column pair for its
    /// context, validating the storage class at the boundary.
    pub fn wrap(&self, ctx: Ctx, value: &Value) -> Result<StoredValue> {
        match (self.storage(ctx), value) {
            (StorageClass::Null, Value::Null) => Ok(StoredValue::default()),
            (StorageClass::Int, Value::Int(num)) => Ok(StoredValue::int(*num)),
            (StorageClass::Bytes, Value::Bytes(bytes)) => Ok(StoredValue::bytes(bytes.clone())),
            (StorageClass::Text, Value::Text(text)) => {
                Ok(StoredValue::bytes(text.clone().into_bytes()))
            }
            (StorageClass::Serialized, Value::Serialized(json)) => {
                if let Some(validator) = self.contexts.get(&ctx).and_then(|e| e.validator.as_ref())
                {
                    if let Err(err) = validator.validate(json) {
                        return Err(Error::StorageClass(format!(
                            "serialized schema validation failed: {err}"
                        )));
                    }
                }
                let bytes = serde_json::to_vec(json)
                    .map_err(|err| Error::StorageClass(format!("unserializable value: {err}")))?;
                Ok(StoredValue::bytes(bytes))
            }
            (class, value) => Err(Error::StorageClass(format!(
                "{class:?} storage cannot hold a {:?} value",
                value.storage_class()
            ))),
        }
    }

    /// Unwrap the stored column pair back into a runtime value.
    pub fn unwrap(&self, ctx: Ctx, stored: StoredValue) -> Result<Value> {
        match self.storage(ctx) {
            StorageClass::Null => Ok(Value::Null),
            StorageClass::Int => Ok(stored.num.map(Value::Int).unwrap_or(Value::Null)),
            StorageClass::Bytes => Ok(stored.bytes.map(Value::Bytes).unwrap_or(Value::Null)),
            StorageClass::Text => match stored.bytes {
                None => Ok(Value::Null),
                Some(bytes) => String::from_utf8(bytes)
                    .map(Value::Text)
                    .map_err(|err| Error::StorageClass(format!("invalid utf-8: {err}"))),
            },
            StorageClass::Serialized => match stored.bytes {
                None => Ok(Value::Null),
                Some(bytes) => serde_json::from_slice(&bytes)
                    .map(Value::Serialized)
                    .map_err(|err| Error::StorageClass(format!("undecodable value: {err}"))),
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn catalog() -> Catalog {
        let mut catalog = Catalog::new();
        catalog
            .register_context(1, Table::Entity, ContextConfig::default())
            .unwrap();
        catalog
            .register_context(
                2,
                Table::Property,
                ContextConfig {
                    base_ctx: Some(1),
                    storage: Some(StorageClass::Int),
                    ..Default::default()
                },
            )
            .unwrap();
        catalog.register_flag(1, 1, "visible").unwrap();
        catalog.register_flag(1, 3, "locked").unwrap();
        catalog
    }

    #[test]
    fn registration_contracts() {
        let mut c = catalog();
        assert!(matches!(
            c.register_context(1, Table::Entity, ContextConfig::default()),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            c.register_context(
                9,
                Table::Alias,
                ContextConfig {
                    base_ctx: Some(42),
                    ..Default::default()
                },
            ),
            Err(Error::Config(_))
        ));
        // Entities are roots and take no parent.
        assert!(matches!(
            c.register_context(
                9,
                Table::Entity,
                ContextConfig {
                    base_ctx: Some(1),
                    ..Default::default()
                },
            ),
            Err(Error::IsRoot(9))
        ));
        assert!(matches!(c.register_flag(1, 0, "x"), Err(Error::Config(_))));
        assert!(matches!(c.register_flag(1, 17, "x"), Err(Error::Config(_))));
        assert!(matches!(c.register_flag(9, 1, "x"), Err(Error::Config(_))));
        assert!(matches!(c.register_flag(1, 1, "x"), Err(Error::Config(_))));
    }

    #[test]
    fn flag_bitmap_round_trip() {
        let c = catalog();
        assert_eq!(c.flags_to_bits(1, &[1, 3]).unwrap(), 0b101);
        assert_eq!(
            c.bits_to_flags(1, 0b101),
            FlagSet::from([1, 3]),
        );
        assert!(matches!(
            c.flags_to_bits(1, &[2]),
            Err(Error::BadFlag { ctx: 1, bit: 2 })
        ));
        // Bits written under a wider registry read back silently dropped.
        assert_eq!(c.bits_to_flags(1, 0b111), FlagSet::from([1, 3]));
        assert_eq!(c.flag_name(1, 3), Some("locked"));
    }

    #[test]
    fn storage_wrap_dispatch() {
        let c = catalog();
        let stored = c.wrap(2, &Value::Int(7)).unwrap();
        assert_eq!(stored.num, Some(7));
        assert_eq!(c.unwrap(2, stored).unwrap(), Value::Int(7));

        assert!(matches!(
            c.wrap(2, &Value::Text("nope".into())),
            Err(Error::StorageClass(_))
        ));
        assert!(matches!(c.wrap(1, &Value::Int(1)), Err(Error::StorageClass(_))));
    }

    #[test]
    fn serialized_schema_validation() {
        let mut c = catalog();
        c.register_context(
            3,
            Table::Node,
            ContextConfig {
                base_ctx: Some(1),
                storage: Some(StorageClass::Serialized),
                schema: Some(serde_json::json!({
                    "type": "object",
                    "required": ["kind"],
                })),
                ..Default::default()
            },
        )
        .unwrap();

        c.wrap(3, &Value::Serialized(serde_json::json!({"kind": "a"})))
            .unwrap();
        assert!(matches!(
            c.wrap(3, &Value::Serialized(serde_json::json!({"other": 1}))),
            Err(Error::StorageClass(_))
        ));
    }
}
