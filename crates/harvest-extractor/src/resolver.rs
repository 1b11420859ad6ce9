//! Entity resolution
//!
//! Merges mentions from many documents into canonical entities. Each mention
//! is reduced to a normalised key; keys of the same entity type whose
//! similarity reaches the configured threshold are joined in a union-find
//! forest, so merging is transitive and the final partition does not depend
//! on the order mentions arrive in.
//!
//! Resolution is batch-scoped: mentions are accumulated with
//! [`Resolver::add`] and canonical entities and relations are produced once
//! by [`Resolver::finalize`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use harvest_core::{
    Annotation, CanonicalEntity, CanonicalRelation, EntityType, MentionId, RelationKey,
    ResolverConfig,
};
use tracing::debug;
use uuid::Uuid;

use crate::union_find::UnionFind;

const HONORIFICS: &[&str] = &["mr", "mrs", "ms", "dr", "prof", "sir"];

const LEGAL_SUFFIXES: &[&str] = &[
    "inc", "corp", "corporation", "co", "ltd", "llc", "plc", "gmbh", "company",
];

// ============================================================================
// Keys and similarity
// ============================================================================

/// Lower-cased, punctuation-stripped form of a surface string.
///
/// Honorifics are dropped from person names and legal suffixes from
/// organisation names, as long as something remains.
pub fn normalize_key(surface: &str, entity_type: EntityType) -> String {
    let cleaned: String = surface
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .flat_map(char::to_lowercase)
        .collect();
    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();

    match entity_type {
        EntityType::Person => strip_edge(&mut tokens, HONORIFICS, true),
        EntityType::Organization => {
            strip_edge(&mut tokens, &["the"], true);
            strip_edge(&mut tokens, LEGAL_SUFFIXES, false);
        }
        EntityType::Location => strip_edge(&mut tokens, &["the"], true),
        _ => {}
    }

    tokens.join(" ")
}

/// Drop listed words from one end of `tokens`, never emptying it
fn strip_edge(tokens: &mut Vec<&str>, words: &[&str], leading: bool) {
    while tokens.len() > 1 {
        let edge = if leading { tokens[0] } else { tokens[tokens.len() - 1] };
        if !words.iter().any(|w| *w == edge) {
            break;
        }
        if leading {
            tokens.remove(0);
        } else {
            tokens.pop();
        }
    }
}

/// Similarity of two normalised keys in `[0, 1]`.
///
/// Single words compare by normalised edit distance. Keys with the same
/// number of words compare word by word, where an initial matches any word
/// it abbreviates. Keys of different lengths compare by word overlap.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }

    let ta: Vec<&str> = a.split_whitespace().collect();
    let tb: Vec<&str> = b.split_whitespace().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }

    match (ta.len(), tb.len()) {
        (1, 1) => strsim::normalized_levenshtein(a, b),
        (la, lb) if la == lb => {
            let total: f64 = ta.iter().zip(&tb).map(|(x, y)| token_similarity(x, y)).sum();
            total / la as f64
        }
        _ => token_overlap(&ta, &tb).max(strsim::normalized_levenshtein(
            &ta.concat(),
            &tb.concat(),
        )),
    }
}

fn is_initial_of(initial: &str, word: &str) -> bool {
    initial.chars().count() == 1 && word.starts_with(initial)
}

fn token_similarity(a: &str, b: &str) -> f64 {
    if a == b || is_initial_of(a, b) || is_initial_of(b, a) {
        1.0
    } else {
        strsim::normalized_levenshtein(a, b)
    }
}

/// Share of the longer key's words matched by the shorter one. At least one
/// word must match exactly.
fn token_overlap(a: &[&str], b: &[&str]) -> f64 {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    let mut used = vec![false; long.len()];
    let mut matched = 0usize;
    let mut exact = false;

    for token in short {
        let hit = long.iter().enumerate().find(|(i, other)| {
            !used[*i] && (token == *other || is_initial_of(token, other) || is_initial_of(other, token))
        });
        if let Some((i, other)) = hit {
            used[i] = true;
            matched += 1;
            exact |= token == other;
        }
    }

    if !exact {
        return 0.0;
    }
    matched as f64 / long.len() as f64
}

// ============================================================================
// Resolver
// ============================================================================

#[derive(Debug)]
struct KeyRecord {
    entity_type: EntityType,
    key: String,
    /// Surface form -> number of mentions
    surfaces: BTreeMap<String, u64>,
    documents: BTreeSet<Uuid>,
}

#[derive(Debug)]
struct Observation {
    subject: usize,
    predicate: String,
    object: usize,
    document_id: Uuid,
}

/// Output of one resolution batch
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Canonical entities ordered by id
    pub entities: Vec<CanonicalEntity>,
    /// Canonical relations ordered by key
    pub relations: Vec<CanonicalRelation>,
    /// Which entity each resolved mention belongs to
    pub mention_entities: HashMap<MentionId, Uuid>,
    /// Relations whose subject and object resolved to the same entity
    pub self_relations_dropped: usize,
}

impl Resolution {
    pub fn entity(&self, entity_id: &Uuid) -> Option<&CanonicalEntity> {
        self.entities.iter().find(|e| &e.entity_id == entity_id)
    }

    pub fn entity_for_mention(&self, mention: &MentionId) -> Option<&CanonicalEntity> {
        self.mention_entities
            .get(mention)
            .and_then(|id| self.entity(id))
    }
}

/// Accumulates annotations and merges their mentions into canonical entities
pub struct Resolver {
    threshold: f64,
    keys: Vec<KeyRecord>,
    index: HashMap<(EntityType, String), usize>,
    by_type: HashMap<EntityType, Vec<usize>>,
    sets: UnionFind,
    mention_keys: HashMap<MentionId, usize>,
    observations: Vec<Observation>,
}

impl Resolver {
    pub fn new(config: &ResolverConfig) -> Self {
        Self {
            threshold: config.similarity_threshold,
            keys: Vec::new(),
            index: HashMap::new(),
            by_type: HashMap::new(),
            sets: UnionFind::new(),
            mention_keys: HashMap::new(),
            observations: Vec::new(),
        }
    }

    /// Number of mentions accepted so far
    pub fn mention_count(&self) -> usize {
        self.mention_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mention_keys.is_empty()
    }

    /// Add one document's mentions and relations to the batch.
    ///
    /// Mentions whose key normalises to nothing are skipped, along with any
    /// relation that refers to them. Returns the number of mentions added.
    pub fn add(&mut self, annotation: &Annotation) -> usize {
        let mut added = 0;

        for mention in &annotation.mentions {
            let key = normalize_key(&mention.surface_text, mention.entity_type);
            if key.is_empty() {
                continue;
            }

            let slot = self.intern(mention.entity_type, key);
            let record = &mut self.keys[slot];
            *record
                .surfaces
                .entry(mention.surface_text.trim().to_string())
                .or_insert(0) += 1;
            record.documents.insert(mention.document_id);

            if self.mention_keys.insert(mention.id, slot).is_none() {
                added += 1;
            }
        }

        for relation in &annotation.relations {
            let (Some(&subject), Some(&object)) = (
                self.mention_keys.get(&relation.subject),
                self.mention_keys.get(&relation.object),
            ) else {
                continue;
            };
            self.observations.push(Observation {
                subject,
                predicate: relation.predicate.clone(),
                object,
                document_id: annotation.document_id,
            });
        }

        debug!(
            document_id = %annotation.document_id,
            mentions = added,
            keys = self.keys.len(),
            "Annotation added to resolution batch"
        );
        added
    }

    /// Slot of `(entity_type, key)`, creating it and merging it with every
    /// similar key of the same type if it is new
    fn intern(&mut self, entity_type: EntityType, key: String) -> usize {
        if let Some(&slot) = self.index.get(&(entity_type, key.clone())) {
            return slot;
        }

        let slot = self.sets.make_set();
        let peers = self.by_type.entry(entity_type).or_default();
        for &other in peers.iter() {
            if similarity(&key, &self.keys[other].key) >= self.threshold {
                self.sets.union(slot, other);
            }
        }
        peers.push(slot);

        self.index.insert((entity_type, key.clone()), slot);
        self.keys.push(KeyRecord {
            entity_type,
            key,
            surfaces: BTreeMap::new(),
            documents: BTreeSet::new(),
        });
        slot
    }

    /// Produce canonical entities and relations for everything added so far
    pub fn finalize(&mut self) -> Resolution {
        let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for slot in 0..self.keys.len() {
            let root = self.sets.find(slot);
            clusters.entry(root).or_default().push(slot);
        }

        let mut slot_entity = vec![Uuid::nil(); self.keys.len()];
        let mut entities = Vec::with_capacity(clusters.len());

        for members in clusters.values() {
            let entity = self.canonical_entity(members);
            for &slot in members {
                slot_entity[slot] = entity.entity_id;
            }
            entities.push(entity);
        }
        entities.sort_by_key(|e| e.entity_id);

        let mut relations: BTreeMap<RelationKey, (u64, BTreeSet<Uuid>)> = BTreeMap::new();
        let mut self_relations_dropped = 0;
        for obs in &self.observations {
            let subject = slot_entity[obs.subject];
            let object = slot_entity[obs.object];
            if subject == object {
                self_relations_dropped += 1;
                continue;
            }
            let entry = relations
                .entry(RelationKey::new(subject, obs.predicate.clone(), object))
                .or_default();
            entry.0 += 1;
            entry.1.insert(obs.document_id);
        }

        let relations: Vec<CanonicalRelation> = relations
            .into_iter()
            .map(|(key, (support_count, source_document_ids))| CanonicalRelation {
                subject_entity_id: key.subject_entity_id,
                predicate: key.predicate,
                object_entity_id: key.object_entity_id,
                support_count,
                source_document_ids,
            })
            .collect();

        let mention_entities = self
            .mention_keys
            .iter()
            .map(|(mention, &slot)| (*mention, slot_entity[slot]))
            .collect();

        debug!(
            entities = entities.len(),
            relations = relations.len(),
            self_relations_dropped,
            "Resolution batch finalised"
        );

        Resolution {
            entities,
            relations,
            mention_entities,
            self_relations_dropped,
        }
    }

    fn canonical_entity(&self, members: &[usize]) -> CanonicalEntity {
        let mut surfaces: BTreeMap<&str, u64> = BTreeMap::new();
        let mut documents = BTreeSet::new();
        let mut smallest_key: Option<&str> = None;
        let entity_type = self.keys[members[0]].entity_type;

        for &slot in members {
            let record = &self.keys[slot];
            for (surface, count) in &record.surfaces {
                *surfaces.entry(surface.as_str()).or_insert(0) += count;
            }
            documents.extend(record.documents.iter().copied());
            smallest_key = match smallest_key {
                Some(k) if k <= record.key.as_str() => Some(k),
                _ => Some(record.key.as_str()),
            };
        }

        // Most frequent surface form; ties go to the lexicographically smallest
        let canonical_name = surfaces
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(surface, _)| surface.to_string())
            .unwrap_or_default();

        CanonicalEntity {
            entity_id: CanonicalEntity::derive_id(entity_type, smallest_key.unwrap_or_default()),
            canonical_name,
            entity_type,
            alias_set: surfaces.keys().map(|s| s.to_string()).collect(),
            source_document_ids: documents,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
