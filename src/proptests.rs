use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::testing::TestLeaves;
use crate::{GcMode, Name, Qp, QpError, QpKey, QpMulti, Qsbr};

/// A generated DNS name in presentation form.
#[derive(Debug, Clone)]
struct DnsName(String);

impl Arbitrary for DnsName {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        let label = prop_oneof![
            // short hostname labels, mixed case to exercise folding
            "[a-zA-Z0-9]{1,4}",
            // labels with escaped bytes outside the hostname alphabet
            "[a-z]{1,2}\\\\22[0-9]",
            Just("xn--c1yn36f".to_string()),
        ];
        (prop::collection::vec(label, 1..4), any::<bool>())
            .prop_map(|(labels, absolute)| {
                let mut text = labels.join(".");
                if absolute {
                    text.push('.');
                }
                DnsName(text)
            })
            .boxed()
    }
}

#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Insert(DnsName),
    Delete(DnsName),
    Get(DnsName),
    Compact,
}

/// The model key: the codec's shift string, which already folds case and
/// trailing separators.
fn model_key(name: &DnsName) -> Vec<u8> {
    QpKey::from_name(&Name::from_text(&name.0).unwrap())
        .as_slice()
        .to_vec()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// The trie behaves like a map from canonical keys to leaves, under any
    /// interleaving of inserts, deletes, lookups, and compactions.
    #[test]
    fn prop_matches_model_map(actions in prop::collection::vec(any::<Action>(), 1..256)) {
        let leaves = TestLeaves::shared();
        let mut qp = Qp::new(leaves.clone());
        let mut model: BTreeMap<Vec<u8>, String> = BTreeMap::new();

        for action in &actions {
            match action {
                Action::Insert(name) => {
                    let leaf = leaves.make_leaf(&name.0);
                    let expect_dup = model.contains_key(&model_key(name));
                    let got = qp.insert(leaf.pval(), leaf.ival());
                    if expect_dup {
                        prop_assert_eq!(got, Err(QpError::Exists));
                    } else {
                        prop_assert!(got.is_ok());
                        model.insert(model_key(name), name.0.clone());
                    }
                }
                Action::Delete(name) => {
                    let got = qp.delete_by_name(&Name::from_text(&name.0).unwrap());
                    let expect = model.remove(&model_key(name)).is_some();
                    prop_assert_eq!(got.is_ok(), expect, "delete {}", name.0);
                }
                Action::Get(name) => {
                    let got = qp.get_by_key(&QpKey::from_name(&Name::from_text(&name.0).unwrap()));
                    prop_assert_eq!(got.is_ok(), model.contains_key(&model_key(name)), "get {}", name.0);
                }
                Action::Compact => qp.compact(GcMode::All),
            }
            prop_assert_eq!(qp.len(), model.len());
        }

        // every surviving key resolves, and traversal order is the model's
        // (canonical) key order
        for text in model.values() {
            prop_assert!(qp.get_by_name(&Name::from_text(text).unwrap()).is_ok(), "{}", text);
        }
        let walked: Vec<Vec<u8>> = qp
            .leaves_in_order()
            .into_iter()
            .map(|(pval, _)| QpKey::from_name(&leaves.name_of(pval)).as_slice().to_vec())
            .collect();
        let expected: Vec<Vec<u8>> = model.keys().cloned().collect();
        prop_assert_eq!(walked, expected);

        drop(qp);
        leaves.assert_no_leaks();
    }
}

#[derive(Arbitrary, Debug, Clone)]
enum TxnOp {
    Insert(DnsName),
    Delete(DnsName),
}

#[derive(Arbitrary, Debug, Clone)]
struct Txn {
    heavy: bool,
    abort: bool,
    ops: Vec<TxnOp>,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Committed versions accumulate exactly the committed transactions;
    /// rolled-back transactions leave no trace; queries between transactions
    /// always see the latest committed version.
    #[test]
    fn prop_transactions_match_model(txns in prop::collection::vec(any::<Txn>(), 1..24)) {
        let leaves = TestLeaves::shared();
        let qsbr = Qsbr::new();
        let multi = QpMulti::new(leaves.clone(), qsbr.clone());
        let mut committed: BTreeMap<Vec<u8>, String> = BTreeMap::new();

        for txn in &txns {
            // only update transactions can roll back
            let heavy = txn.heavy || txn.abort;
            let mut scratch = committed.clone();
            let mut handle = if heavy { multi.update() } else { multi.write() };
            for op in &txn.ops {
                match op {
                    TxnOp::Insert(name) => {
                        let leaf = leaves.make_leaf(&name.0);
                        if handle.insert(leaf.pval(), leaf.ival()).is_ok() {
                            scratch.insert(model_key(name), name.0.clone());
                        }
                    }
                    TxnOp::Delete(name) => {
                        let key = QpKey::from_name(&Name::from_text(&name.0).unwrap());
                        if handle.delete_by_key(&key).is_ok() {
                            scratch.remove(&model_key(name));
                        }
                    }
                }
            }
            if txn.abort {
                handle.rollback();
            } else {
                handle.commit();
                committed = scratch;
            }

            let view = multi.query();
            for (key, text) in &committed {
                let k = QpKey::from_name(&Name::from_text(text).unwrap());
                prop_assert_eq!(k.as_slice(), &key[..]);
                prop_assert!(view.get_by_key(&k).is_ok(), "{} missing after commit", text);
            }
            prop_assert_eq!(multi.mem_usage().leaves as usize, committed.len());
        }

        drop(multi);
        qsbr.poll();
        leaves.assert_no_leaks();
    }
}
