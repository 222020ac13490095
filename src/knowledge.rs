//! Per-domain cluster trees over knowledge items.
//!
//! A domain's items are partitioned recursively with seeded k-means; every
//! node stores the normalised mean of its subtree's item embeddings, along
//! with their raw sum so inserts keep that mean exact. Inserts
//! and queries walk a single greedy path from the root, following the child
//! whose centroid is closest to the item or query, so both cost
//! O(depth × branching) instead of O(items).
//!
//! Inserting never splits a node. A leaf that grows past
//! [`KnowledgeConfig::max_leaf_size`] is only flagged; [`KnowledgeTree::rebalance`]
//! or [`KnowledgeTree::rebuild_domain`] re-clusters the domain later.

use rand::{SeedableRng, rngs::StdRng};
use serde::Serialize;

use crate::{
    clustering::kmeans,
    config::KnowledgeConfig,
    embedding::{Embedder, embed_in_batches, embedding_space},
    error::{Error, Result},
    records::{EmbeddingSpace, KnowledgeItem, KnowledgeNode, SourceKind, now_secs},
    store::{Store, domain_space_key},
    vector::{cosine, normalize, sum_vectors},
};

const EMBED_BATCH: usize = 64;

/// Confidence of a fact written through [`KnowledgeTree::learn`].
pub const INFERRED_CONFIDENCE: f32 = 0.7;

/// Confidence added when an already known fact is learned again.
pub const CONFIDENCE_STEP: f32 = 0.1;

/// A knowledge item ranked against a query.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeMatch {
    #[serde(flatten)]
    pub item: KnowledgeItem,
    pub score: f32,
}

/// Shape of a freshly built domain tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TreeSummary {
    pub domain: String,
    pub nodes: usize,
    pub leaves: usize,
    pub items: usize,
    /// Depth of the deepest node; the root sits at 0.
    pub depth: u32,
}

/// Nodes laid out parents-first, plus the owning node of every item.
struct Arena {
    nodes: Vec<KnowledgeNode>,
    parents: Vec<Option<usize>>,
    placement: Vec<usize>,
    leaves: usize,
}

pub struct KnowledgeTree<'a> {
    store: &'a Store,
    embedder: &'a dyn Embedder,
    config: KnowledgeConfig,
}

impl<'a> KnowledgeTree<'a> {
    pub fn new(store: &'a Store, embedder: &'a dyn Embedder, config: KnowledgeConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Replace `domain`'s tree with one clustered from `items`.
    ///
    /// Items without an embedding are embedded first. Items that already
    /// carry an id keep it. The same items and seed always produce the same
    /// tree.
    pub fn build_tree(&self, domain: &str, mut items: Vec<KnowledgeItem>) -> Result<TreeSummary> {
        if items.is_empty() {
            self.store.clear_domain(domain)?;
            tracing::info!(domain, "cleared empty knowledge domain");
            return Ok(TreeSummary {
                domain: domain.to_string(),
                ..Default::default()
            });
        }

        let missing: Vec<usize> = (0..items.len())
            .filter(|&i| items[i].embedding.is_empty())
            .collect();
        if !missing.is_empty() {
            let texts: Vec<String> = missing.iter().map(|&i| items[i].content.clone()).collect();
            let vectors = embed_in_batches(self.embedder, &texts, EMBED_BATCH)?;
            for (i, vector) in missing.into_iter().zip(vectors) {
                items[i].embedding = vector;
            }
        }

        let mut arena = Arena {
            nodes: Vec::new(),
            parents: Vec::new(),
            placement: vec![0; items.len()],
            leaves: 0,
        };
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let members: Vec<usize> = (0..items.len()).collect();
        self.partition(&items, &members, 0, None, &mut arena, &mut rng);

        let summary = TreeSummary {
            domain: domain.to_string(),
            nodes: arena.nodes.len(),
            leaves: arena.leaves,
            items: items.len(),
            depth: arena.nodes.iter().map(|n| n.depth).max().unwrap_or(0),
        };

        self.store.replace_domain_tree(
            domain,
            &mut arena.nodes,
            &arena.parents,
            &mut items,
            &arena.placement,
        )?;
        self.record_space(domain, items[0].embedding.len())?;

        tracing::info!(
            domain,
            nodes = summary.nodes,
            leaves = summary.leaves,
            items = summary.items,
            depth = summary.depth,
            "built knowledge tree"
        );
        Ok(summary)
    }

    /// Push a node for `members` and, unless it is a leaf, its subtrees.
    fn partition(
        &self,
        items: &[KnowledgeItem],
        members: &[usize],
        depth: usize,
        parent: Option<usize>,
        arena: &mut Arena,
        rng: &mut StdRng,
    ) {
        let member_sum = sum_vectors(members.iter().map(|&m| items[m].embedding.as_slice()))
            .map(|(sum, _)| sum)
            .unwrap_or_default();
        let index = arena.nodes.len();
        arena.nodes.push(KnowledgeNode {
            depth: depth as u32,
            item_count: members.len() as u32,
            centroid: normalized(&member_sum),
            member_sum,
            ..Default::default()
        });
        arena.parents.push(parent);

        let branching = self.config.branching_at(depth);
        let is_leaf = members.len() <= self.config.min_leaf_size
            || depth >= self.config.max_depth
            || members.len() <= branching;

        let clusters = if is_leaf {
            Vec::new()
        } else {
            let vectors: Vec<&[f32]> = members
                .iter()
                .map(|&m| items[m].embedding.as_slice())
                .collect();
            kmeans(&vectors, branching, self.config.max_iterations, rng).members()
        };

        if clusters.len() <= 1 {
            for &m in members {
                arena.placement[m] = index;
            }
            arena.leaves += 1;
            return;
        }

        for cluster in clusters {
            let subset: Vec<usize> = cluster.into_iter().map(|i| members[i]).collect();
            self.partition(items, &subset, depth + 1, Some(index), arena, rng);
        }
    }

    /// Insert one fact into `domain`, creating the domain on first use.
    pub fn add_item(
        &self,
        content: &str,
        domain: &str,
        source: SourceKind,
        source_path: Option<&str>,
    ) -> Result<KnowledgeItem> {
        let item = KnowledgeItem {
            domain: domain.to_string(),
            content: content.to_string(),
            source,
            source_path: source_path.map(str::to_string),
            confidence: 1.0,
            created_at: now_secs(),
            embedding: self.embedder.embed(content)?,
            ..Default::default()
        };
        self.check_space(domain, item.embedding.len())?;
        let path = match self.store.domain_root(domain)? {
            Some(root) => self.descend(root, &item.embedding)?,
            None => Vec::new(),
        };
        self.insert(item, path)
    }

    /// Record an inferred fact. A fact already stored in the leaf it would
    /// land in (compared case-insensitively) gains confidence instead of
    /// being duplicated.
    pub fn learn(&self, fact: &str, domain: &str) -> Result<KnowledgeItem> {
        let fact = fact.trim();
        let embedding = self.embedder.embed(fact)?;
        self.check_space(domain, embedding.len())?;
        let path = match self.store.domain_root(domain)? {
            Some(root) => self.descend(root, &embedding)?,
            None => Vec::new(),
        };

        if let Some(leaf) = path.last() {
            let known = self
                .store
                .node_items(leaf.id)?
                .into_iter()
                .find(|i| i.content.trim().eq_ignore_ascii_case(fact));
            if let Some(mut item) = known {
                item.confidence = (item.confidence + CONFIDENCE_STEP).min(1.0);
                self.store.put_knowledge(&mut [], std::slice::from_mut(&mut item))?;
                tracing::debug!(domain, id = item.id, confidence = item.confidence, "reinforced fact");
                return Ok(item);
            }
        }

        let item = KnowledgeItem {
            domain: domain.to_string(),
            content: fact.to_string(),
            source: SourceKind::Inferred,
            confidence: INFERRED_CONFIDENCE,
            created_at: now_secs(),
            embedding,
            ..Default::default()
        };
        self.insert(item, path)
    }

    /// Attach `item` to the last node of `path` and refresh the path's
    /// centroids and counts. An empty path creates the domain's root.
    fn insert(&self, mut item: KnowledgeItem, mut path: Vec<KnowledgeNode>) -> Result<KnowledgeItem> {
        let Some(mut leaf) = path.pop() else {
            let mut root = KnowledgeNode {
                domain: item.domain.clone(),
                item_count: 1,
                centroid: item.embedding.clone(),
                member_sum: item.embedding.clone(),
                ..Default::default()
            };
            self.store.put_knowledge(std::slice::from_mut(&mut root), &mut [])?;
            item.node_id = root.id;
            self.store.put_knowledge(&mut [], std::slice::from_mut(&mut item))?;
            self.record_space(&item.domain, item.embedding.len())?;
            tracing::debug!(domain = %item.domain, root = root.id, "created knowledge domain");
            return Ok(item);
        };

        leaf.item_count += 1;
        if leaf.item_count as usize > self.config.max_leaf_size {
            leaf.needs_split = true;
        }

        for node in path.iter_mut().chain([&mut leaf]) {
            if node.member_sum.len() != item.embedding.len() {
                node.member_sum = self.subtree_sum(node.id, item.embedding.len())?;
            }
            add_member(node, &item.embedding);
        }
        for ancestor in &mut path {
            ancestor.item_count += 1;
        }

        item.node_id = leaf.id;
        let needs_split = leaf.needs_split;
        path.push(leaf);
        self.store
            .put_knowledge(&mut path, std::slice::from_mut(&mut item))?;

        if needs_split {
            tracing::debug!(domain = %item.domain, node = item.node_id, "leaf flagged for split");
        }
        Ok(item)
    }

    fn check_space(&self, domain: &str, dimension: usize) -> Result<()> {
        match self.store.embedding_space(&domain_space_key(domain))? {
            Some(indexed) if !indexed.matches(self.embedder.model_id(), dimension) => {
                Err(Error::ModelMismatch {
                    indexed: indexed.to_string(),
                    current: self.space(dimension).to_string(),
                    remedy: "run `deskindex rebuild-domain` to re-embed the domain",
                })
            }
            _ => Ok(()),
        }
    }

    fn record_space(&self, domain: &str, dimension: usize) -> Result<()> {
        self.store
            .set_embedding_space(&domain_space_key(domain), &self.space(dimension))
    }

    fn space(&self, dimension: usize) -> EmbeddingSpace {
        EmbeddingSpace {
            model: self.embedder.model_id().to_string(),
            dimension,
        }
    }

    /// Sum of the stored item embeddings below `node_id`. Used for nodes
    /// written without a member sum.
    fn subtree_sum(&self, node_id: u64, dimension: usize) -> Result<Vec<f32>> {
        let mut items = Vec::new();
        let mut pending = vec![node_id];
        while let Some(id) = pending.pop() {
            items.extend(self.store.node_items(id)?);
            pending.extend(self.store.node_children(id)?.iter().map(|c| c.id));
        }
        Ok(sum_vectors(items.iter().map(|i| i.embedding.as_slice()))
            .map(|(sum, _)| sum)
            .filter(|sum| sum.len() == dimension)
            .unwrap_or_else(|| vec![0.0; dimension]))
    }

    /// Root-to-leaf path chosen greedily by centroid similarity. Ties go to
    /// the child with the lower id.
    fn descend(&self, root: KnowledgeNode, embedding: &[f32]) -> Result<Vec<KnowledgeNode>> {
        let mut path = vec![root];
        loop {
            let Some(current) = path.last() else { break };
            let children = self.store.node_children(current.id)?;
            let mut best: Option<(f32, KnowledgeNode)> = None;
            for child in children {
                let score = cosine(embedding, &child.centroid);
                if best.as_ref().is_none_or(|(s, _)| score > *s) {
                    best = Some((score, child));
                }
            }
            match best {
                Some((_, child)) => path.push(child),
                None => break,
            }
        }
        Ok(path)
    }

    /// The `top_k` items of the leaf reached by greedy descent, best first.
    ///
    /// An unknown domain yields no results. Returned items have their access
    /// count incremented.
    pub fn query(&self, text: &str, domain: &str, top_k: usize) -> Result<Vec<KnowledgeMatch>> {
        let Some(root) = self.store.domain_root(domain)? else {
            return Ok(Vec::new());
        };
        let embedding = self.embedder.embed(text)?;
        self.check_space(domain, embedding.len())?;
        let path = self.descend(root, &embedding)?;
        let Some(leaf) = path.last() else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<KnowledgeMatch> = self
            .store
            .node_items(leaf.id)?
            .into_iter()
            .map(|item| KnowledgeMatch {
                score: cosine(&embedding, &item.embedding),
                item,
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.item.id.cmp(&b.item.id))
        });
        matches.truncate(top_k);

        let mut touched: Vec<KnowledgeItem> = matches
            .iter_mut()
            .map(|m| {
                m.item.access_count += 1;
                m.item.clone()
            })
            .collect();
        self.store.put_knowledge(&mut [], &mut touched)?;

        tracing::debug!(domain, leaf = leaf.id, depth = path.len() - 1, results = matches.len(), "knowledge query");
        Ok(matches)
    }

    /// Re-cluster `domain` from its stored items. Items are re-embedded only
    /// when the domain was built with a different embedder.
    pub fn rebuild_domain(&self, domain: &str) -> Result<TreeSummary> {
        let mut items = self.store.domain_items(domain)?;
        if items.is_empty() {
            return Err(Error::NotFound {
                kind: "knowledge domain",
                name: domain.to_string(),
            });
        }

        self.drop_stale_embeddings(domain, &mut items)?;
        self.build_tree(domain, items)
    }

    /// Replace every item of `domain` recorded from `source` with `facts` and
    /// re-cluster the domain. Items from other sources are kept.
    pub fn replace_source_items(
        &self,
        domain: &str,
        source: SourceKind,
        facts: &[String],
    ) -> Result<TreeSummary> {
        let mut items: Vec<KnowledgeItem> = self
            .store
            .domain_items(domain)?
            .into_iter()
            .filter(|i| i.source != source)
            .collect();
        self.drop_stale_embeddings(domain, &mut items)?;

        let created_at = now_secs();
        let replaced = facts.len();
        items.extend(facts.iter().map(|fact| KnowledgeItem {
            domain: domain.to_string(),
            content: fact.trim().to_string(),
            source,
            confidence: 1.0,
            created_at,
            ..Default::default()
        }));
        tracing::debug!(domain, ?source, replaced, "replacing knowledge items");
        self.build_tree(domain, items)
    }

    /// Clear item embeddings produced by another embedder so that
    /// [`KnowledgeTree::build_tree`] computes them again.
    fn drop_stale_embeddings(&self, domain: &str, items: &mut [KnowledgeItem]) -> Result<()> {
        let current = embedding_space(self.embedder)?;
        if let Some(indexed) = self.store.embedding_space(&domain_space_key(domain))?
            && indexed != current
        {
            tracing::info!(domain, indexed = %indexed, current = %current, "re-embedding knowledge domain");
            for item in items.iter_mut() {
                item.embedding.clear();
            }
        }
        Ok(())
    }

    /// Rebuild `domain` if any of its leaves was flagged as oversized.
    pub fn rebalance(&self, domain: &str) -> Result<Option<TreeSummary>> {
        let flagged = self
            .store
            .domain_nodes(domain)?
            .iter()
            .any(|n| n.needs_split);
        if !flagged {
            return Ok(None);
        }
        self.rebuild_domain(domain).map(Some)
    }
}

/// Count `embedding` into a node's member sum and refresh its centroid.
fn add_member(node: &mut KnowledgeNode, embedding: &[f32]) {
    for (acc, e) in node.member_sum.iter_mut().zip(embedding) {
        *acc += e;
    }
    node.centroid = normalized(&node.member_sum);
}

fn normalized(v: &[f32]) -> Vec<f32> {
    let mut v = v.to_vec();
    normalize(&mut v);
    v
}
