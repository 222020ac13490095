use deskindex::{
    HashEmbedder,
    KnowledgeTree,
    Store,
    config::KnowledgeConfig,
    records::{KnowledgeItem, SourceKind},
};

const SYSTEM_FACTS: &[&str] = &[
    "cpu: 8 cores at 3.2 GHz",
    "memory: 32 GB installed",
    "disk: 1 TB nvme ssd, 412 GB free",
    "gpu: integrated graphics",
    "os: linux 6.8 desktop",
    "display: 2560x1440 external monitor",
    "wifi: connected to home network",
    "battery: 87 percent, charging",
    "printer: office laser printer on the network",
    "keyboard: mechanical, us layout",
    "webcam: 1080p built in",
];

fn open_store() -> (tempfile::TempDir, Store) {
    let tmp = tempfile::tempdir().unwrap();
    let store = Store::open(&tmp.path().join("index.redb")).unwrap();
    (tmp, store)
}

fn leaf_count(store: &Store, domain: &str) -> usize {
    store
        .domain_nodes(domain)
        .unwrap()
        .iter()
        .filter(|n| store.node_children(n.id).unwrap().is_empty())
        .count()
}

#[test]
fn eleventh_insert_defers_split_to_rebuild() {
    let (_tmp, store) = open_store();
    let embedder = HashEmbedder::default();
    let config = KnowledgeConfig::default();
    assert_eq!(config.min_leaf_size, 10);
    let tree = KnowledgeTree::new(&store, &embedder, config);

    for fact in &SYSTEM_FACTS[..10] {
        tree.add_item(fact, "system", SourceKind::System, None).unwrap();
    }
    assert_eq!(leaf_count(&store, "system"), 1);

    tree.add_item(SYSTEM_FACTS[10], "system", SourceKind::System, None)
        .unwrap();
    assert_eq!(store.domain_nodes("system").unwrap().len(), 1);
    assert_eq!(leaf_count(&store, "system"), 1);

    let summary = tree.rebuild_domain("system").unwrap();
    assert_eq!(summary.items, 11);
    assert!(summary.leaves >= 2);
    assert_eq!(leaf_count(&store, "system"), summary.leaves);

    let root = store.domain_root("system").unwrap().unwrap();
    assert_eq!(root.item_count, 11);
    assert!(root.parent_id.is_none());
    for child in store.node_children(root.id).unwrap() {
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_id, Some(root.id));
    }
}

#[test]
fn same_items_build_the_same_tree() {
    let embedder = HashEmbedder::default();
    let items: Vec<KnowledgeItem> = SYSTEM_FACTS
        .iter()
        .cycle()
        .take(40)
        .enumerate()
        .map(|(i, f)| KnowledgeItem {
            content: format!("{f} (note {i})"),
            source: SourceKind::System,
            ..Default::default()
        })
        .collect();

    let shape = |store: &Store| {
        let mut nodes: Vec<(u32, u32)> = store
            .domain_nodes("system")
            .unwrap()
            .iter()
            .map(|n| (n.depth, n.item_count))
            .collect();
        nodes.sort_unstable();
        nodes
    };

    let (_a_tmp, a) = open_store();
    let (_b_tmp, b) = open_store();
    KnowledgeTree::new(&a, &embedder, KnowledgeConfig::default())
        .build_tree("system", items.clone())
        .unwrap();
    KnowledgeTree::new(&b, &embedder, KnowledgeConfig::default())
        .build_tree("system", items)
        .unwrap();
    assert_eq!(shape(&a), shape(&b));

    let ask = |store: &Store| {
        KnowledgeTree::new(store, &embedder, KnowledgeConfig::default())
            .query("how much memory is installed", "system", 3)
            .unwrap()
            .into_iter()
            .map(|m| m.item.content)
            .collect::<Vec<_>>()
    };
    let first = ask(&a);
    assert!(!first.is_empty());
    assert_eq!(first, ask(&a));
    assert_eq!(first, ask(&b));
}

#[test]
fn query_walks_to_relevant_leaf() {
    let (_tmp, store) = open_store();
    let embedder = HashEmbedder::default();
    let tree = KnowledgeTree::new(&store, &embedder, KnowledgeConfig::default());

    let mut items: Vec<KnowledgeItem> = Vec::new();
    for i in 0..15 {
        items.push(KnowledgeItem {
            content: format!("photo {i}: beach sunset with sailing boats"),
            ..Default::default()
        });
        items.push(KnowledgeItem {
            content: format!("invoice {i}: electricity bill paid by bank transfer"),
            ..Default::default()
        });
    }
    let summary = tree.build_tree("mixed", items).unwrap();
    assert!(summary.nodes > 1);

    let results = tree.query("beach sunset photo", "mixed", 5).unwrap();
    assert!(!results.is_empty());
    assert!(results.len() <= 5);
    assert!(results.iter().all(|m| m.item.content.contains("beach sunset")));
}

#[test]
fn knowledge_survives_reopen_and_file_reindex() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("index.redb");
    let embedder = HashEmbedder::default();

    {
        let store = Store::open(&path).unwrap();
        let tree = KnowledgeTree::new(&store, &embedder, KnowledgeConfig::default());
        tree.learn("prefers metric units", "personal").unwrap();
        store.clear_file_index().unwrap();
    }

    let store = Store::open(&path).unwrap();
    let tree = KnowledgeTree::new(&store, &embedder, KnowledgeConfig::default());
    let results = tree.query("units", "personal", 1).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].item.content, "prefers metric units");
    assert_eq!(results[0].item.source, SourceKind::Inferred);
}
