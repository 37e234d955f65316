//! Test fixtures: a leaf registry that checks the attach/detach discipline.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::key::QpKey;
use crate::name::Name;
use crate::node::Node;
use crate::trie::QpMethods;

#[derive(Default)]
struct Registry {
    names: Vec<Name>,
    refs: Vec<i64>,
    ids: HashMap<String, usize>,
}

/// A [`QpMethods`] implementation whose leaves are indices into a registry
/// of names. Reference counts are tracked per leaf so tests can assert that
/// every internal copy the trie takes is eventually released.
#[derive(Default)]
pub(crate) struct TestLeaves {
    registry: Mutex<Registry>,
}

impl TestLeaves {
    pub(crate) fn shared() -> Arc<TestLeaves> {
        Arc::new(TestLeaves::default())
    }

    /// Register `text` (idempotently) and return a leaf node for it, with a
    /// reference count of zero until the trie attaches it.
    pub(crate) fn make_leaf(&self, text: &str) -> Node {
        let name = Name::from_text(text).expect("test name parses");
        let folded = text.to_ascii_lowercase();
        let mut reg = self.registry.lock();
        let id = match reg.ids.get(&folded).copied() {
            Some(id) => id,
            None => {
                let id = reg.names.len();
                reg.names.push(name);
                reg.refs.push(0);
                reg.ids.insert(folded, id);
                id
            }
        };
        Node::leaf(Self::pval(id), id as u32)
    }

    fn pval(id: usize) -> *mut c_void {
        ((id + 1) << 4) as *mut c_void
    }

    fn id(pval: *mut c_void) -> usize {
        (pval as usize >> 4) - 1
    }

    pub(crate) fn name_of(&self, pval: *mut c_void) -> Name {
        self.registry.lock().names[Self::id(pval)].clone()
    }

    pub(crate) fn refcount(&self, text: &str) -> i64 {
        let reg = self.registry.lock();
        let id = reg.ids[&text.to_ascii_lowercase()];
        reg.refs[id]
    }

    /// Every leaf the trie ever attached must have been detached again.
    pub(crate) fn assert_no_leaks(&self) {
        let reg = self.registry.lock();
        for (id, &refs) in reg.refs.iter().enumerate() {
            assert_eq!(refs, 0, "leaf {} leaked: {}", reg.names[id], refs);
        }
    }
}

impl QpMethods for TestLeaves {
    fn attach(&self, pval: *mut c_void, _ival: u32) {
        self.registry.lock().refs[Self::id(pval)] += 1;
    }

    fn detach(&self, pval: *mut c_void, _ival: u32) {
        let mut reg = self.registry.lock();
        let id = Self::id(pval);
        reg.refs[id] -= 1;
        assert!(reg.refs[id] >= 0, "leaf {} over-detached", reg.names[id]);
    }

    fn leaf_key(&self, pval: *mut c_void, _ival: u32, key: &mut QpKey) {
        *key = QpKey::from_name(&self.registry.lock().names[Self::id(pval)]);
    }

    fn trie_name(&self) -> &str {
        "test"
    }
}
