use std::{path::Path, sync::Arc};

use deskindex::{
    Embedder,
    FileRouter,
    HashEmbedder,
    Indexer,
    Store,
    config::{ChunkingConfig, IndexerConfig, RouterConfig},
    router::FileFilters,
};

const TOPICS: &[&str] = &[
    "holiday", "recipe", "poem", "lyrics", "sketch", "diary", "letter",
    "checklist", "itinerary", "workout", "garden", "reading", "homework",
    "meeting", "packing", "gift", "wedding", "camping", "podcast", "movie",
];

const WORDS: &[&str] = &[
    "sunset", "harbour", "violin", "pancake", "mountain", "lantern", "orchard",
    "glacier", "meadow", "compass", "velvet", "thunder", "pebble", "saffron",
    "canyon", "willow", "ember", "lagoon", "prairie", "quartz",
];

fn router_for(tree: &Path, config: RouterConfig) -> (tempfile::TempDir, FileRouter) {
    let db = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&db.path().join("index.redb")).unwrap());
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::default());
    Indexer::new(&store, embedder.as_ref(), &IndexerConfig::default())
        .unwrap()
        .index_from_root(tree)
        .unwrap();
    (
        db,
        FileRouter::new(store, embedder, config, ChunkingConfig::default()),
    )
}

/// A home directory with a budget spreadsheet, its notes and 500 files about
/// other things.
fn home_with_budget() -> tempfile::TempDir {
    let tree = tempfile::tempdir().unwrap();
    for i in 0..500 {
        let topic = TOPICS[i % TOPICS.len()];
        let dir = tree.path().join(format!("{topic}s")).join(format!("set-{}", i % 5));
        std::fs::create_dir_all(&dir).unwrap();
        let ext = ["txt", "md", "jpg"][i % 3];
        let body = format!(
            "{topic} {} {} {}",
            WORDS[i % WORDS.len()],
            WORDS[(i * 7) % WORDS.len()],
            WORDS[(i * 13) % WORDS.len()]
        );
        std::fs::write(dir.join(format!("{topic}-{i}.{ext}")), body).unwrap();
    }

    let finance = tree.path().join("Documents").join("Finance");
    std::fs::create_dir_all(&finance).unwrap();
    std::fs::write(finance.join("2024-budget.xlsx"), b"PK\x03\x04 not really zip").unwrap();
    std::fs::write(
        finance.join("budget-notes.txt"),
        "Budget notes for 2024. The household budget allows 400 for groceries \
         and 150 for transport each month. Rent stays at 1200.",
    )
    .unwrap();
    tree
}

#[tokio::test(flavor = "multi_thread")]
async fn budget_spreadsheet_among_unrelated_files() {
    let tree = home_with_budget();
    let (_db, router) = router_for(tree.path(), RouterConfig::default());
    assert_eq!(router.store().file_count().unwrap(), 502);

    let results = router.find_relevant_files("budget spreadsheet", 10).unwrap();
    let position = results
        .iter()
        .position(|m| m.file.path.ends_with("Documents/Finance/2024-budget.xlsx"))
        .expect("budget spreadsheet not found");
    assert!(position < 3, "found at rank {position}");

    // Finding files never materialises chunks.
    assert_eq!(router.store().chunk_count().unwrap(), 0);
    assert_eq!(router.store().status().unwrap().chunked_files, 0);

    let content = router
        .search_with_content("household budget groceries", 5, 3)
        .await
        .unwrap();
    assert!(!content.chunks.is_empty());
    assert!(content.chunks[0].file_path.ends_with("budget-notes.txt"));
    assert!(router.store().chunk_count().unwrap() > 0);

    // Only the shortlisted files with content were chunked.
    let chunked = router.store().status().unwrap().chunked_files;
    assert!(chunked >= 1);
    assert!(chunked <= RouterConfig::default().chunk_candidates as u64);
}

#[test]
fn near_tied_siblings_are_both_explored() {
    let tree = tempfile::tempdir().unwrap();
    for year in ["2023", "2024"] {
        let dir = tree.path().join(format!("Taxes{year}"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(format!("tax-return-{year}.txt")),
            format!("federal tax return for {year}"),
        )
        .unwrap();
    }
    for other in ["Music", "Photos", "Games"] {
        let dir = tree.path().join(other);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("readme.txt"), format!("{other} collection")).unwrap();
    }

    let config = RouterConfig {
        beam_width: 1,
        ..Default::default()
    };
    let (_db, router) = router_for(tree.path(), config);
    let results = router.find_relevant_files("tax return", 10).unwrap();
    let names: Vec<&str> = results.iter().map(|m| m.file.name.as_str()).collect();
    assert!(names.contains(&"tax-return-2023.txt"), "{names:?}");
    assert!(names.contains(&"tax-return-2024.txt"), "{names:?}");
}

#[test]
fn results_are_ranked_and_deduplicated() {
    let tree = home_with_budget();
    let (_db, router) = router_for(tree.path(), RouterConfig::default());

    let results = router.find_relevant_files("garden meadow", 20).unwrap();
    assert!(!results.is_empty());
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    let mut paths: Vec<&str> = results.iter().map(|m| m.file.path.as_str()).collect();
    paths.sort_unstable();
    paths.dedup();
    assert_eq!(paths.len(), results.len());
    assert!(results.iter().all(|m| m.score >= RouterConfig::default().min_result_score));
}

#[test]
fn extension_filter_narrows_results() {
    let tree = home_with_budget();
    let (_db, router) = router_for(tree.path(), RouterConfig::default());

    let filters = FileFilters {
        extensions: vec!["xlsx".to_string()],
        ..Default::default()
    };
    let results = router.find_with_filters("budget", &filters, 5).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].file.name, "2024-budget.xlsx");

    let filters = FileFilters {
        location: Some("finance".to_string()),
        ..Default::default()
    };
    let results = router.find_with_filters("budget", &filters, 5).unwrap();
    assert_eq!(results.len(), 2);
}
