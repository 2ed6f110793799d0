use proptest::prelude::*;
use std::sync::{Arc, Mutex};
use tabula_core::{
    CellFormat, CellPatch, CellRecord, CellRef, Document, Origin, ReplicaId, Scalar,
    UpdateKind,
};

const REPLICAS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Value { replica: usize, row: u32, col: u32, v: i64 },
    Formula { replica: usize, row: u32, col: u32, clear: bool },
    Format { replica: usize, row: u32, col: u32, bold: bool },
    Delete { replica: usize, row: u32, col: u32 },
    Meta { replica: usize, v: i64 },
    Sync { from: usize, to: usize },
}

fn op() -> impl Strategy<Value = Op> {
    let r = 0..REPLICAS;
    prop_oneof![
        4 => (r.clone(), 0..4u32, 0..4u32, 0..100i64)
            .prop_map(|(replica, row, col, v)| Op::Value { replica, row, col, v }),
        2 => (r.clone(), 0..4u32, 0..4u32, any::<bool>())
            .prop_map(|(replica, row, col, clear)| Op::Formula { replica, row, col, clear }),
        2 => (r.clone(), 0..4u32, 0..4u32, any::<bool>())
            .prop_map(|(replica, row, col, bold)| Op::Format { replica, row, col, bold }),
        1 => (r.clone(), 0..4u32, 0..4u32)
            .prop_map(|(replica, row, col)| Op::Delete { replica, row, col }),
        1 => (r.clone(), 0..100i64).prop_map(|(replica, v)| Op::Meta { replica, v }),
        1 => (r.clone(), r).prop_map(|(from, to)| Op::Sync { from, to }),
    ]
}

struct Cluster {
    docs: Vec<Document>,
    /// Locally produced updates, in production order.
    log: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Cluster {
    fn new() -> Self {
        let log = Arc::new(Mutex::new(Vec::new()));
        let docs = (0..REPLICAS)
            .map(|i| {
                let mut doc = Document::with_replica(ReplicaId::from_u128(i as u128 + 1));
                let sink = log.clone();
                doc.on_update(move |u| {
                    if u.kind == UpdateKind::Document && u.origin == Origin::Local {
                        sink.lock().unwrap().push(u.update.clone());
                    }
                })
                .detach();
                doc
            })
            .collect();
        Self { docs, log }
    }

    fn run(&mut self, op: &Op) {
        match *op {
            Op::Value { replica, row, col, v } => {
                self.docs[replica].set_cell(row, col, CellPatch::value(v))
            }
            Op::Formula { replica, row, col, clear } => {
                let patch = if clear {
                    CellPatch::new().clear_formula()
                } else {
                    CellPatch::new().with_formula(format!("=R{}", row))
                };
                self.docs[replica].set_cell(row, col, patch)
            }
            Op::Format { replica, row, col, bold } => self.docs[replica].set_cell(
                row,
                col,
                CellPatch::format(CellFormat::new().with("bold", bold)),
            ),
            Op::Delete { replica, row, col } => self.docs[replica].delete_cell(row, col),
            Op::Meta { replica, v } => self.docs[replica].set_meta("rows", v),
            Op::Sync { from, to } if from != to => {
                let sv = self.docs[to].encode_state_vector();
                let diff = self.docs[from].encode_diff(&sv).unwrap();
                self.docs[to].apply_update(&diff).unwrap();
            }
            Op::Sync { .. } => {}
        }
    }

    fn updates(&self) -> Vec<Vec<u8>> {
        self.log.lock().unwrap().clone()
    }
}

fn view(doc: &Document) -> (Vec<(CellRef, CellRecord)>, Option<Scalar>) {
    (doc.all_cells(), doc.get_meta("rows"))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn replicas_converge_after_full_exchange(ops in proptest::collection::vec(op(), 1..40)) {
        let mut cluster = Cluster::new();
        for op in &ops {
            cluster.run(op);
        }
        for from in 0..REPLICAS {
            for to in 0..REPLICAS {
                cluster.run(&Op::Sync { from, to });
            }
        }
        let expected = view(&cluster.docs[0]);
        for doc in &cluster.docs[1..] {
            prop_assert_eq!(view(doc), expected.clone());
        }
    }

    #[test]
    fn delivery_order_and_duplicates_do_not_matter(
        ops in proptest::collection::vec(op(), 1..40),
        seed in any::<u64>(),
    ) {
        let mut cluster = Cluster::new();
        for op in &ops {
            cluster.run(op);
        }
        let updates = cluster.updates();

        let mut in_order = Document::with_replica(ReplicaId::from_u128(100));
        for u in &updates {
            in_order.apply_update(u).unwrap();
        }

        // deterministic shuffle with every update delivered twice
        let mut shuffled: Vec<&Vec<u8>> = updates.iter().chain(updates.iter()).collect();
        let mut state = seed | 1;
        for i in (1..shuffled.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            shuffled.swap(i, (state % (i as u64 + 1)) as usize);
        }
        let mut out_of_order = Document::with_replica(ReplicaId::from_u128(101));
        for u in shuffled {
            out_of_order.apply_update(u).unwrap();
        }

        prop_assert_eq!(view(&in_order), view(&out_of_order));
        prop_assert_eq!(in_order.state_vector(), out_of_order.state_vector());
    }

    #[test]
    fn snapshot_equals_replayed_history(ops in proptest::collection::vec(op(), 1..40)) {
        let mut cluster = Cluster::new();
        for op in &ops {
            cluster.run(op);
        }
        let mut replayed = Document::with_replica(ReplicaId::from_u128(100));
        for u in cluster.updates() {
            replayed.apply_update(&u).unwrap();
        }
        let mut hydrated = Document::with_replica(ReplicaId::from_u128(101));
        hydrated.apply_update(&replayed.encode_state()).unwrap();

        prop_assert_eq!(view(&hydrated), view(&replayed));
    }
}
