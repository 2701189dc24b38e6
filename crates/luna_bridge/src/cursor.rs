//! Lazy traversal of interpreter-side tables.
//!
//! A [`TableCursor`] walks a table one entry at a time without materializing
//! a full host-side copy. Each step keeps exactly one table entry alive
//! through interpreter-side references (the table and the current key);
//! advancing or dropping the cursor releases them. Dereferencing copies only
//! the current pair through the value model, which for nested tables is a
//! deep copy and can be expensive.

use std::sync::Arc;

use mlua::{Function, Table as LuaTable, Value as LuaValue};

use crate::engine::{probe_kind, pull_root, push_value, EngineShared};
use crate::error::BridgeError;
use crate::value::{Value, ValueKind};

pub struct TableCursor {
    shared: Arc<EngineShared>,
    slot: Option<CursorSlot>,
    current: Option<(Value, Value)>,
}

struct CursorSlot {
    table: LuaTable,
    key: LuaValue,
}

impl TableCursor {
    /// Cursor over `source`, positioned on its first entry, or on
    /// `first_key` when one is given. Anything that is not a table yields a
    /// finished cursor.
    pub(crate) fn over(
        shared: Arc<EngineShared>,
        source: &LuaValue,
        first_key: Option<&Value>,
    ) -> Result<Self, BridgeError> {
        let LuaValue::Table(table) = source else {
            return Ok(Self::finished(shared));
        };
        let slot = match first_key {
            Some(key) if key.kind() != ValueKind::Nil => Some(CursorSlot {
                table: table.clone(),
                key: push_value(&shared, key)?,
            }),
            _ => {
                let (key, _) = raw_next(&shared, table, LuaValue::Nil)?;
                if key.is_nil() {
                    None
                } else {
                    Some(CursorSlot {
                        table: table.clone(),
                        key,
                    })
                }
            }
        };
        Ok(Self {
            shared,
            slot,
            current: None,
        })
    }

    pub(crate) fn finished(shared: Arc<EngineShared>) -> Self {
        Self {
            shared,
            slot: None,
            current: None,
        }
    }

    /// False once the cursor has moved past the last entry.
    pub fn is_valid(&self) -> bool {
        self.slot.is_some()
    }

    /// Step to the next entry. Forward-only; a finished cursor stays
    /// finished.
    pub fn advance(&mut self) -> Result<(), BridgeError> {
        self.current = None;
        if let Some(slot) = self.slot.take() {
            let (key, _) = raw_next(&self.shared, &slot.table, slot.key)?;
            if !key.is_nil() {
                self.slot = Some(CursorSlot {
                    table: slot.table,
                    key,
                });
            }
        }
        Ok(())
    }

    /// Copy the current key without touching the value.
    pub fn key(&self) -> Value {
        match &self.slot {
            Some(slot) => pull_root(&self.shared, &slot.key, false),
            None => Value::Invalid,
        }
    }

    pub fn key_type(&self) -> ValueKind {
        match &self.slot {
            Some(slot) => probe_kind(&self.shared, &slot.key),
            None => ValueKind::Invalid,
        }
    }

    pub fn value_type(&self) -> ValueKind {
        match self.current_raw_value() {
            Some(v) => probe_kind(&self.shared, &v),
            None => ValueKind::Invalid,
        }
    }

    /// The current pair, copied through the value model and cached until the
    /// cursor moves. A finished cursor yields `(Invalid, Invalid)`.
    pub fn entry(&mut self) -> &(Value, Value) {
        let Self {
            shared,
            slot,
            current,
        } = self;
        current.get_or_insert_with(|| match slot {
            Some(s) => {
                let key = pull_root(shared, &s.key, false);
                let value = match s.table.raw_get::<LuaValue>(s.key.clone()) {
                    Ok(v) => pull_root(shared, &v, false),
                    Err(_) => Value::Invalid,
                };
                (key, value)
            }
            None => (Value::Invalid, Value::Invalid),
        })
    }

    /// Replace the value under the current key, leaving the key and the
    /// traversal position untouched.
    pub fn set_value(&mut self, value: &Value) -> Result<(), BridgeError> {
        if let Some(slot) = &self.slot {
            let converted = push_value(&self.shared, value)?;
            slot.table.raw_set(slot.key.clone(), converted)?;
            self.current = None;
        }
        Ok(())
    }

    /// Sub-cursor over the current key, which must itself be a table
    /// (otherwise the cursor is finished).
    pub fn key_cursor(&self, first_key: Option<&Value>) -> Result<TableCursor, BridgeError> {
        match &self.slot {
            Some(slot) => TableCursor::over(self.shared.clone(), &slot.key, first_key),
            None => Ok(Self::finished(self.shared.clone())),
        }
    }

    /// Sub-cursor over the current value, which must itself be a table
    /// (otherwise the cursor is finished).
    pub fn value_cursor(&self, first_key: Option<&Value>) -> Result<TableCursor, BridgeError> {
        match self.current_raw_value() {
            Some(v) => TableCursor::over(self.shared.clone(), &v, first_key),
            None => Ok(Self::finished(self.shared.clone())),
        }
    }

    fn current_raw_value(&self) -> Option<LuaValue> {
        let slot = self.slot.as_ref()?;
        slot.table.raw_get::<LuaValue>(slot.key.clone()).ok()
    }
}

// Two cursors are equal only if both are finished, or both reference the
// same table and key by raw identity.
impl PartialEq for TableCursor {
    fn eq(&self, other: &Self) -> bool {
        match (&self.slot, &other.slot) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                a.table.to_pointer() == b.table.to_pointer() && raw_eq(&a.key, &b.key)
            }
            _ => false,
        }
    }
}

// Stepping uses the interpreter's raw `next`, the same primitive its own
// table traversal is built on.
fn raw_next(
    shared: &Arc<EngineShared>,
    table: &LuaTable,
    key: LuaValue,
) -> Result<(LuaValue, LuaValue), BridgeError> {
    let next: Function = shared.lua().globals().get("next")?;
    let pair: (LuaValue, LuaValue) = next.call((table.clone(), key))?;
    Ok(pair)
}

fn raw_eq(a: &LuaValue, b: &LuaValue) -> bool {
    match (a, b) {
        (LuaValue::Nil, LuaValue::Nil) => true,
        (LuaValue::Boolean(x), LuaValue::Boolean(y)) => x == y,
        (LuaValue::Integer(x), LuaValue::Integer(y)) => x == y,
        (LuaValue::Number(x), LuaValue::Number(y)) => x == y,
        (LuaValue::Integer(x), LuaValue::Number(y)) => *x as f64 == *y,
        (LuaValue::Number(x), LuaValue::Integer(y)) => *x == *y as f64,
        (LuaValue::String(x), LuaValue::String(y)) => x == y,
        (LuaValue::LightUserData(x), LuaValue::LightUserData(y)) => x.0 == y.0,
        (LuaValue::Table(_), LuaValue::Table(_))
        | (LuaValue::Function(_), LuaValue::Function(_))
        | (LuaValue::UserData(_), LuaValue::UserData(_)) => a.to_pointer() == b.to_pointer(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ScriptEngine;
    use std::collections::BTreeMap;

    fn engine_with_table() -> ScriptEngine {
        let engine = ScriptEngine::new().expect("engine");
        engine.set_auto_clear_stack(false);
        let result = engine.execute_sync(
            "g = { a = 1, b = 'two', nested = { x = 10 } } return g",
            "setup",
        );
        assert!(result.success, "{}", result.error_message);
        engine
    }

    #[test]
    fn test_traversal_collects_all_entries() {
        let engine = engine_with_table();
        let mut cursor = engine.cursor(1, None).expect("cursor");
        let mut seen = BTreeMap::new();
        while cursor.is_valid() {
            let (key, value) = cursor.entry().clone();
            seen.insert(key, value);
            cursor.advance().expect("advance");
        }
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[&Value::from("a")], Value::Integer(1));
        assert_eq!(seen[&Value::from("b")], Value::from("two"));
        assert_eq!(seen[&Value::from("nested")].kind(), ValueKind::Table);
    }

    #[test]
    fn test_positioning_on_a_known_key() {
        let engine = engine_with_table();
        let cursor = engine.cursor(1, Some(&Value::from("a"))).expect("cursor");
        assert!(cursor.is_valid());
        assert_eq!(cursor.key(), Value::from("a"));
        assert_eq!(cursor.key_type(), ValueKind::String);
        assert_eq!(cursor.value_type(), ValueKind::Integer);
    }

    #[test]
    fn test_sub_cursor_over_nested_table() {
        let engine = engine_with_table();
        let mut cursor = engine
            .cursor(1, Some(&Value::from("nested")))
            .expect("cursor");
        assert_eq!(cursor.value_type(), ValueKind::Table);
        let mut sub = cursor.value_cursor(None).expect("sub-cursor");
        assert!(sub.is_valid());
        assert_eq!(sub.entry(), &(Value::from("x"), Value::Integer(10)));
        sub.advance().expect("advance");
        assert!(!sub.is_valid());

        // a key that is not a table yields a finished sub-cursor
        assert!(!cursor.key_cursor(None).expect("key cursor").is_valid());
    }

    #[test]
    fn test_set_value_keeps_key_and_position() {
        let engine = engine_with_table();
        let mut cursor = engine.cursor(1, Some(&Value::from("a"))).expect("cursor");
        cursor.set_value(&Value::Integer(42)).expect("set_value");
        assert_eq!(cursor.key(), Value::from("a"));
        assert_eq!(cursor.entry().1, Value::Integer(42));
        let global = engine.get_global("g").expect("get_global");
        assert_eq!(
            global.table().unwrap().entries[&Value::from("a")],
            Value::Integer(42)
        );
    }

    #[test]
    fn test_equality_is_identity_based() {
        let engine = engine_with_table();
        let a = engine.cursor(1, Some(&Value::from("a"))).expect("cursor");
        let b = engine.cursor(1, Some(&Value::from("a"))).expect("cursor");
        assert!(a == b);

        let mut c = engine.cursor(1, Some(&Value::from("a"))).expect("cursor");
        c.advance().expect("advance");
        assert!(c != b);

        let mut d = engine.cursor(1, None).expect("cursor");
        let mut e = engine.cursor(1, None).expect("cursor");
        while d.is_valid() {
            d.advance().expect("advance");
        }
        while e.is_valid() {
            e.advance().expect("advance");
        }
        assert!(d == e); // both past the end
    }

    #[test]
    fn test_cursor_keeps_table_alive() {
        let engine = engine_with_table();
        let mut cursor = engine.cursor(1, None).expect("cursor");
        engine.clear_stack();
        let result = engine.execute_sync("g = nil collectgarbage('collect')", "drop");
        assert!(result.success, "{}", result.error_message);
        let mut count = 0;
        while cursor.is_valid() {
            count += 1;
            cursor.advance().expect("advance");
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_non_table_slot_gives_finished_cursor() {
        let engine = ScriptEngine::new().expect("engine");
        engine.push(&Value::Integer(5)).expect("push");
        assert!(!engine.cursor(1, None).expect("cursor").is_valid());
        assert!(!engine.cursor(99, None).expect("cursor").is_valid());
    }

    #[test]
    fn test_global_cursor_sees_globals() {
        let engine = engine_with_table();
        let mut cursor = engine.global_cursor(None).expect("cursor");
        let mut found = false;
        while cursor.is_valid() {
            if cursor.key() == Value::from("g") {
                found = true;
                break;
            }
            cursor.advance().expect("advance");
        }
        assert!(found);
    }
}
