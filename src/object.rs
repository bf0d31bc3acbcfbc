//! Heap object data and the capability dispatch protocol (§3 "Object").
//!
//! `Object` is the tagged enum every heap-allocated value takes; each
//! variant is data-only (no vtable) and capability dispatch happens by
//! matching on the tag in the free functions below, mirroring how the
//! source's virtual-method hierarchy collapses into one dispatch point in
//! a systems-language port (§9 "Deep inheritance").

use ahash::AHashMap;

use crate::acl::Acl;
use crate::ast::Action;
use crate::error::MethodStatus;
use crate::heap::{HeapId, Heaps};
use crate::value::Value;

/// An immutable byte-string plus a lazily compiled regex handle used by
/// `Match`/`NotMatch` (§3 "String", §4.2).
#[derive(Debug)]
pub struct StrObj {
    text: Box<str>,
    regex_cache: std::cell::RefCell<Option<Option<regex::Regex>>>,
}

impl StrObj {
    pub fn new(text: String) -> Self {
        Self { text: text.into_boxed_str(), regex_cache: std::cell::RefCell::new(None) }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Compiles (once) and runs the string as a regex against `subject`.
    /// An invalid pattern makes every `Match`/`NotMatch` against it fail,
    /// cached so the compile is attempted only once.
    fn is_match(&self, subject: &str) -> Result<bool, String> {
        let mut cache = self.regex_cache.borrow_mut();
        if cache.is_none() {
            *cache = Some(regex::Regex::new(&self.text).ok());
        }
        match cache.as_ref().unwrap() {
            Some(re) => Ok(re.is_match(subject)),
            None => Err(format!("invalid regex pattern: '{}'", self.text)),
        }
    }
}

/// Default maximum number of elements a `List` may hold (§3 "List").
pub const DEFAULT_LIST_MAX: usize = 262_144;

#[derive(Debug)]
pub struct ListObj {
    items: Vec<Value>,
    max_len: usize,
}

impl ListObj {
    pub fn new(max_len: usize) -> Self {
        Self { items: Vec::new(), max_len }
    }

    pub fn from_vec(items: Vec<Value>, max_len: usize) -> Self {
        Self { items, max_len }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: i64) -> Option<Value> {
        let idx = self.normalize_index(index)?;
        self.items.get(idx).copied()
    }

    pub fn set(&mut self, index: i64, value: Value) -> Result<(), String> {
        let idx = self.normalize_index(index).ok_or_else(|| "list index out of bounds".to_string())?;
        self.items[idx] = value;
        Ok(())
    }

    pub fn push(&mut self, value: Value) -> Result<(), String> {
        if self.items.len() >= self.max_len {
            return Err(format!("list exceeds maximum length {}", self.max_len));
        }
        self.items.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.items.pop()
    }

    /// Removes and returns the element at `index`, shifting later elements
    /// down (`unset lst[i]`).
    pub fn remove_at(&mut self, index: i64) -> Result<Value, String> {
        let idx = self.normalize_index(index).ok_or_else(|| "list index out of bounds".to_string())?;
        Ok(self.items.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = Value> + '_ {
        self.items.iter().copied()
    }

    fn normalize_index(&self, index: i64) -> Option<usize> {
        let len = self.items.len() as i64;
        let real = if index < 0 { index + len } else { index };
        if real < 0 || real >= len { None } else { Some(real as usize) }
    }
}

/// A single chain slot in the open-addressing dict table: a bucket head
/// points to a slot index, and each slot's `next` continues the chain
/// (§3 "Dict").
#[derive(Debug, Clone)]
struct DictSlot {
    hash: u64,
    key_id: HeapId,
    key_text: Box<str>,
    value: Value,
    next: i64,
    tombstone: bool,
}

const DICT_MAX_LOAD: f64 = 0.75;

#[derive(Debug, Default)]
pub struct DictObj {
    buckets: Vec<i64>,
    slots: Vec<DictSlot>,
    insertion_order: Vec<usize>,
    live_count: usize,
}

fn hash_str(s: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = ahash::AHasher::default();
    s.hash(&mut hasher);
    hasher.finish()
}

impl DictObj {
    pub fn new() -> Self {
        let mut d = Self::default();
        d.buckets = vec![-1; 8];
        d
    }

    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) % self.buckets.len()
    }

    fn find_slot(&self, key: &str, hash: u64) -> Option<usize> {
        let mut cur = self.buckets[self.bucket_of(hash)];
        while cur >= 0 {
            let slot = &self.slots[cur as usize];
            if !slot.tombstone && slot.hash == hash && &*slot.key_text == key {
                return Some(cur as usize);
            }
            cur = slot.next;
        }
        None
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let hash = hash_str(key);
        self.find_slot(key, hash).map(|i| self.slots[i].value)
    }

    pub fn insert(&mut self, key_id: HeapId, key: &str, value: Value) {
        let hash = hash_str(key);
        if let Some(i) = self.find_slot(key, hash) {
            self.slots[i].value = value;
            return;
        }
        if (self.live_count + 1) as f64 / self.buckets.len() as f64 > DICT_MAX_LOAD {
            self.rehash();
        }
        let bucket = self.bucket_of(hash);
        let slot_index = self.slots.len();
        self.slots.push(DictSlot {
            hash,
            key_id,
            key_text: key.into(),
            value,
            next: self.buckets[bucket],
            tombstone: false,
        });
        self.buckets[bucket] = slot_index as i64;
        self.insertion_order.push(slot_index);
        self.live_count += 1;
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let hash = hash_str(key);
        match self.find_slot(key, hash) {
            Some(i) => {
                self.slots[i].tombstone = true;
                self.live_count -= 1;
                true
            }
            None => false,
        }
    }

    fn rehash(&mut self) {
        let new_size = self.buckets.len() * 2;
        let mut new_buckets = vec![-1i64; new_size];
        for &slot_index in &self.insertion_order {
            if self.slots[slot_index].tombstone {
                continue;
            }
            let hash = self.slots[slot_index].hash;
            let bucket = (hash as usize) % new_size;
            self.slots[slot_index].next = new_buckets[bucket];
            new_buckets[bucket] = slot_index as i64;
        }
        self.buckets = new_buckets;
    }

    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }

    /// Insertion-ordered iteration over live entries only (§3 "Dict").
    pub fn iter(&self) -> impl Iterator<Item = (&str, Value)> + '_ {
        self.insertion_order
            .iter()
            .map(|&i| &self.slots[i])
            .filter(|s| !s.tombstone)
            .map(|s| (&*s.key_text, s.value))
    }

    pub fn key_ids(&self) -> impl Iterator<Item = HeapId> + '_ {
        self.insertion_order.iter().map(|&i| &self.slots[i]).filter(|s| !s.tombstone).map(|s| s.key_id)
    }
}

/// A host-registered extension type's runtime state. Hosts implement this
/// to back `TypeName { .field = expr; }` literals (§4.10 "ExtensionFactory").
pub trait ExtensionState: std::fmt::Debug {
    fn type_name(&self) -> &str;
    fn get_attribute(&self, _name: &str) -> MethodStatus<Value> {
        MethodStatus::Unimplemented("GetAttribute")
    }
    fn set_attribute(&mut self, _name: &str, _value: Value) -> MethodStatus<()> {
        MethodStatus::Unimplemented("SetAttribute")
    }
    fn unset_attribute(&mut self, _name: &str) -> MethodStatus<()> {
        MethodStatus::Unimplemented("UnsetAttribute")
    }
    /// Traces any heap references the extension's internal state holds.
    fn trace(&self, _visit: &mut dyn FnMut(HeapId)) {}
}

#[derive(Debug)]
pub struct ExtensionObj {
    pub inner: Box<dyn ExtensionState>,
}

/// A host callback identified by a registry index. The closure itself
/// lives in `Context`/`Engine` registries (§4.10 "Function"), not on the
/// GC heap, since host closures are not `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionObj {
    pub registry_index: u32,
    pub from_engine: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionObj {
    pub code: Action,
    pub payload: Option<Value>,
}

#[derive(Debug, Default)]
pub struct ModuleObj {
    pub entries: AHashMap<String, Value>,
}

/// A compiled subroutine's runtime handle: an index into the owning
/// `CompiledCode`'s procedure table (§3 "SubRoutine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRoutineObj {
    pub procedure_index: u32,
}

#[derive(Debug, Clone, Copy)]
pub enum IteratorObj {
    List { container: HeapId, next: usize },
    Dict { container: HeapId, next: usize },
}

impl IteratorObj {
    pub fn container(&self) -> HeapId {
        match *self {
            Self::List { container, .. } | Self::Dict { container, .. } => container,
        }
    }
}

/// The heap object tag. See the module doc for why dispatch is a `match`
/// rather than a vtable.
#[derive(Debug)]
pub enum Object {
    Str(StrObj),
    Acl(Acl),
    List(ListObj),
    Dict(DictObj),
    Function(FunctionObj),
    Extension(ExtensionObj),
    Action(ActionObj),
    Module(ModuleObj),
    SubRoutine(SubRoutineObj),
    Iterator(IteratorObj),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Acl(_) => "acl",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Function(_) => "function",
            Self::Extension(_) => "extension",
            Self::Action(_) => "action",
            Self::Module(_) => "module",
            Self::SubRoutine(_) => "sub_routine",
            Self::Iterator(_) => "iterator",
        }
    }

    /// Visits every `HeapId` this object directly references, for the GC
    /// mark phase (`DoMark`, §3 "Object").
    pub fn trace(&self, visit: &mut dyn FnMut(HeapId)) {
        match self {
            Self::List(list) => {
                for v in list.iter() {
                    if let Some(id) = v.heap_id() {
                        visit(id);
                    }
                }
            }
            Self::Dict(dict) => {
                for id in dict.key_ids() {
                    visit(id);
                }
                for (_, v) in dict.iter() {
                    if let Some(id) = v.heap_id() {
                        visit(id);
                    }
                }
            }
            Self::Module(module) => {
                for v in module.entries.values() {
                    if let Some(id) = v.heap_id() {
                        visit(id);
                    }
                }
            }
            Self::Action(action) => {
                if let Some(Some(id)) = action.payload.map(|v| v.heap_id()) {
                    visit(id);
                }
            }
            Self::Iterator(it) => visit(it.container()),
            Self::Extension(ext) => ext.inner.trace(visit),
            Self::Str(_) | Self::Acl(_) | Self::Function(_) | Self::SubRoutine(_) => {}
        }
    }

    /// Rough byte estimate fed to the allocator hook (§4.8).
    pub fn approx_size(&self) -> usize {
        match self {
            Self::Str(s) => s.as_str().len() + 32,
            Self::Acl(acl) => acl.programs.len() * 48 + 24,
            Self::List(list) => list.len() * std::mem::size_of::<Value>() + 24,
            Self::Dict(dict) => dict.len() * 64 + 24,
            Self::Module(module) => module.entries.len() * 64 + 24,
            _ => 32,
        }
    }
}

/// `ToBoolean` across both primitives and heap objects.
pub fn to_bool(heaps: &Heaps<'_>, value: &Value) -> bool {
    if let Some(b) = value.to_bool_primitive() {
        return b;
    }
    match heaps.get(value.heap_id().expect("non-primitive")) {
        Object::Str(s) => !s.as_str().is_empty(),
        Object::List(l) => !l.is_empty(),
        Object::Dict(d) => !d.is_empty(),
        _ => true,
    }
}

/// `ToString`. Per §9's resolved ambiguity: integers and strings convert
/// successfully; `null`/`size`/`duration` fail (matching observed tests in
/// the original implementation).
pub fn to_display_string(heaps: &Heaps<'_>, value: &Value) -> MethodStatus<String> {
    match value {
        Value::Int(i) => MethodStatus::Ok(i.to_string()),
        Value::Real(r) => MethodStatus::Ok(r.to_string()),
        Value::Bool(b) => MethodStatus::Ok(b.to_string()),
        Value::Null => MethodStatus::Fail("cannot convert null to string".to_string()),
        Value::Size(s) => MethodStatus::Fail(format!("cannot convert size ({s}) to string")),
        Value::Duration(d) => MethodStatus::Fail(format!("cannot convert duration ({d}) to string")),
        _ => match heaps.get(value.heap_id().unwrap()) {
            Object::Str(s) => MethodStatus::Ok(s.as_str().to_string()),
            Object::Action(a) => MethodStatus::Ok(format!("{:?}", a.code).to_lowercase()),
            other => MethodStatus::Unimplemented(Box::leak(
                format!("ToString on {}", other.type_name()).into_boxed_str(),
            )),
        },
    }
}

/// `Match`/`NotMatch` capability on the left-hand string operand (§3
/// "String", §9 resolved ambiguity: `NotMatch` succeeds iff `Match`
/// succeeds, returning the negated boolean).
pub fn string_match(heaps: &Heaps<'_>, lhs: &Value, pattern: &str) -> MethodStatus<bool> {
    let Value::String(id) = lhs else {
        return MethodStatus::Unimplemented("Match");
    };
    let Object::Str(s) = heaps.get(*id) else { unreachable!() };
    match s.is_match(pattern) {
        Ok(b) => MethodStatus::Ok(b),
        Err(e) => MethodStatus::Fail(e),
    }
}

/// `Match`/`NotMatch` (`~`/`!~`) dispatch on the right-hand operand: a
/// string is a regular expression tested against the left-hand string; an
/// ACL tests whether the left-hand string, parsed as an IP address, falls
/// inside one of the ACL's entries.
pub fn match_value(heaps: &Heaps<'_>, lhs: &Value, rhs: &Value) -> MethodStatus<bool> {
    if let Value::Acl(acl_id) = rhs {
        let Object::Acl(acl) = heaps.get(*acl_id) else { unreachable!() };
        let Value::String(addr_id) = lhs else {
            return MethodStatus::Fail("acl match requires a string address on the left-hand side".to_string());
        };
        let Object::Str(addr) = heaps.get(*addr_id) else { unreachable!() };
        return match addr.as_str().parse::<std::net::IpAddr>() {
            Ok(ip) => MethodStatus::Ok(acl.matches(ip)),
            Err(_) => MethodStatus::Fail(format!("'{}' is not a valid IP address", addr.as_str())),
        };
    }
    if let Value::String(pattern_id) = rhs {
        let Object::Str(pattern) = heaps.get(*pattern_id) else { unreachable!() };
        let pattern_text = pattern.as_str().to_string();
        return string_match(heaps, lhs, &pattern_text);
    }
    MethodStatus::Unimplemented("Match")
}

pub fn not_match_value(heaps: &Heaps<'_>, lhs: &Value, rhs: &Value) -> MethodStatus<bool> {
    match match_value(heaps, lhs, rhs) {
        MethodStatus::Ok(b) => MethodStatus::Ok(!b),
        other => other,
    }
}

/// `GetIndex` (`lst[i]`, `dict[s]` via index syntax).
pub fn get_index(heaps: &Heaps<'_>, recv: &Value, index: &Value) -> MethodStatus<Value> {
    match heaps.get(recv.heap_id().expect("non-primitive receiver")) {
        Object::List(list) => {
            let Value::Int(i) = index else {
                return MethodStatus::Fail("list index must be an integer".to_string());
            };
            match list.get(i64::from(*i)) {
                Some(v) => MethodStatus::Ok(v),
                None => MethodStatus::Fail(format!("list index {i} out of bounds")),
            }
        }
        Object::Dict(dict) => {
            let Value::String(key_id) = index else {
                return MethodStatus::Fail("dict index must be a string".to_string());
            };
            let Object::Str(key) = heaps.get(*key_id) else { unreachable!() };
            match dict.get(key.as_str()) {
                Some(v) => MethodStatus::Ok(v),
                None => MethodStatus::Fail(format!("no such key '{}'", key.as_str())),
            }
        }
        _ => MethodStatus::Unimplemented("GetIndex"),
    }
}

pub fn set_index(heaps: &mut Heaps<'_>, recv: &Value, index: &Value, value: Value) -> MethodStatus<()> {
    let recv_id = recv.heap_id().expect("non-primitive receiver");
    match index {
        Value::Int(i) => {
            let i = *i;
            if let Object::List(list) = heaps.get_mut(recv_id) {
                return match list.set(i64::from(i), value) {
                    Ok(()) => MethodStatus::Ok(()),
                    Err(e) => MethodStatus::Fail(e),
                };
            }
            MethodStatus::Unimplemented("SetIndex")
        }
        Value::String(key_id) => {
            let Object::Str(key) = heaps.get(*key_id) else { unreachable!() };
            let key_text = key.as_str().to_string();
            let key_id = *key_id;
            if let Object::Dict(dict) = heaps.get_mut(recv_id) {
                dict.insert(key_id, &key_text, value);
                return MethodStatus::Ok(());
            }
            MethodStatus::Unimplemented("SetIndex")
        }
        _ => MethodStatus::Fail("unsupported index type".to_string()),
    }
}

/// `GetProperty` (`.name` on dicts/modules/extensions treated as named
/// field access) and `GetAttribute` (`:name`, dash-allowed header-style
/// access) share one implementation here because the only type that
/// distinguishes them (extensions, which expose `GetAttribute` for
/// host-defined state) opts in explicitly.
pub fn get_property(heaps: &Heaps<'_>, recv: &Value, name: &str) -> MethodStatus<Value> {
    match heaps.get(recv.heap_id().expect("non-primitive receiver")) {
        Object::Dict(dict) => match dict.get(name) {
            Some(v) => MethodStatus::Ok(v),
            None => MethodStatus::Fail(format!("no such key '{name}'")),
        },
        Object::Module(module) => match module.entries.get(name) {
            Some(v) => MethodStatus::Ok(*v),
            None => MethodStatus::Fail(format!("no such module entry '{name}'")),
        },
        Object::Extension(ext) => ext.inner.get_attribute(name),
        _ => MethodStatus::Unimplemented("GetProperty"),
    }
}

pub fn get_attribute(heaps: &Heaps<'_>, recv: &Value, name: &str) -> MethodStatus<Value> {
    get_property(heaps, recv, name)
}

/// `SetProperty` (`.name = expr`). Dicts and modules accept any name;
/// extensions delegate to [`set_attribute`] since that is the capability
/// they opt into.
pub fn set_property(heaps: &mut Heaps<'_>, recv: &Value, name: &str, value: Value) -> MethodStatus<()> {
    let id = recv.heap_id().expect("non-primitive receiver");
    match heaps.get(id) {
        Object::Dict(_) => {
            let key_id = match heaps.alloc(Object::Str(StrObj::new(name.to_string()))) {
                Ok(id) => id,
                Err(e) => return MethodStatus::Fail(e),
            };
            let Object::Dict(dict) = heaps.get_mut(id) else { unreachable!() };
            dict.insert(key_id, name, value);
            MethodStatus::Ok(())
        }
        Object::Module(_) => {
            let Object::Module(module) = heaps.get_mut(id) else { unreachable!() };
            module.entries.insert(name.to_string(), value);
            MethodStatus::Ok(())
        }
        Object::Extension(_) => set_attribute(heaps, recv, name, value),
        _ => MethodStatus::Unimplemented("SetProperty"),
    }
}

pub fn set_attribute(heaps: &mut Heaps<'_>, recv: &Value, name: &str, value: Value) -> MethodStatus<()> {
    let id = recv.heap_id().expect("non-primitive receiver");
    if let Object::Extension(ext) = heaps.get_mut(id) {
        return ext.inner.set_attribute(name, value);
    }
    MethodStatus::Unimplemented("SetAttribute")
}

/// `Unset` (removing a dict key, or the script-level `unset req:http.X`
/// pattern against an extension).
pub fn unset(heaps: &mut Heaps<'_>, recv: &Value, name: &str) -> MethodStatus<()> {
    let id = recv.heap_id().expect("non-primitive receiver");
    match heaps.get_mut(id) {
        Object::Dict(dict) => {
            if dict.remove(name) {
                MethodStatus::Ok(())
            } else {
                MethodStatus::Fail(format!("no such key '{name}'"))
            }
        }
        Object::Extension(ext) => ext.inner.unset_attribute(name),
        _ => MethodStatus::Unimplemented("Unset"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dict_preserves_insertion_order() {
        let mut d = DictObj::new();
        let dummy = HeapId { origin: crate::heap::Origin::Context, index: 0 };
        d.insert(dummy, "b", Value::Int(2));
        d.insert(dummy, "a", Value::Int(1));
        let keys: Vec<&str> = d.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn dict_tombstones_hide_removed_keys() {
        let mut d = DictObj::new();
        let dummy = HeapId { origin: crate::heap::Origin::Context, index: 0 };
        d.insert(dummy, "a", Value::Int(1));
        assert!(d.remove("a"));
        assert_eq!(d.get("a"), None);
        assert_eq!(d.iter().count(), 0);
    }

    #[test]
    fn dict_rehashes_under_load() {
        let mut d = DictObj::new();
        let dummy = HeapId { origin: crate::heap::Origin::Context, index: 0 };
        for i in 0..100 {
            d.insert(dummy, &format!("k{i}"), Value::Int(i));
        }
        assert_eq!(d.len(), 100);
        for i in 0..100 {
            assert_eq!(d.get(&format!("k{i}")), Some(Value::Int(i)));
        }
    }

    #[test]
    fn list_negative_index_wraps() {
        let mut l = ListObj::new(DEFAULT_LIST_MAX);
        l.push(Value::Int(1)).unwrap();
        l.push(Value::Int(2)).unwrap();
        l.push(Value::Int(3)).unwrap();
        assert_eq!(l.get(-1), Some(Value::Int(3)));
    }

    #[test]
    fn list_respects_max_len() {
        let mut l = ListObj::new(1);
        l.push(Value::Int(1)).unwrap();
        assert!(l.push(Value::Int(2)).is_err());
    }
}
