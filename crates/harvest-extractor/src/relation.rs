//! Relation Extraction (RE) module
//!
//! Extracts relations (triples) between entities of one document. A pattern
//! fires when a keyword appears in the text between two entities of the
//! expected types, within one sentence.

use serde::{Deserialize, Serialize};

use harvest_core::EntityType;

use crate::{ExtractedEntity, ExtractedRelation, RelationExtractor};

// ============================================================================
// Relation Types
// ============================================================================

/// Relation types recognized by the RE system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    WorksAt,   // Person -> Organization
    CeoOf,     // Person -> Organization
    Founded,   // Person -> Organization
    Acquired,  // Organization -> Organization
    LocatedIn, // Organization -> Location
    LivesIn,   // Person -> Location
    BornIn,    // Person -> Location
    RelatedTo, // Generic relation
}

impl RelationType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorksAt => "works_at",
            Self::CeoOf => "ceo_of",
            Self::Founded => "founded",
            Self::Acquired => "acquired",
            Self::LocatedIn => "located_in",
            Self::LivesIn => "lives_in",
            Self::BornIn => "born_in",
            Self::RelatedTo => "related_to",
        }
    }

    /// Get from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace([' ', '-'], "_").as_str() {
            "works_at" | "works_for" => Some(Self::WorksAt),
            "ceo_of" => Some(Self::CeoOf),
            "founded" => Some(Self::Founded),
            "acquired" => Some(Self::Acquired),
            "located_in" | "based_in" => Some(Self::LocatedIn),
            "lives_in" => Some(Self::LivesIn),
            "born_in" => Some(Self::BornIn),
            "related_to" => Some(Self::RelatedTo),
            _ => None,
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Rule-based RE
// ============================================================================

/// Pattern for extracting relations
#[derive(Debug, Clone)]
pub struct RelationPattern {
    /// Subject entity type
    pub subject_type: EntityType,
    /// Object entity type
    pub object_type: EntityType,
    /// Relation type
    pub relation: RelationType,
    /// Whether the subject precedes the object in the text
    pub subject_first: bool,
    /// Pattern keywords (between the two entities)
    pub keywords: Vec<String>,
    /// Phrases that veto the pattern, such as a passive "acquired by"
    pub exclusions: Vec<String>,
    /// Maximum distance between entities (in bytes)
    pub max_distance: usize,
    /// Confidence score
    pub confidence: f32,
}

/// Rule-based relation extractor
pub struct RuleBasedRe {
    patterns: Vec<RelationPattern>,
}

impl RuleBasedRe {
    /// Create a new rule-based RE with the default English patterns
    pub fn new() -> Self {
        let mut re = Self {
            patterns: Vec::new(),
        };
        re.init_patterns();
        re
    }

    fn init_patterns(&mut self) {
        use EntityType::{Location, Organization, Person};

        // Employment
        self.add_pattern(
            Person,
            Organization,
            RelationType::WorksAt,
            true,
            vec![
                "works at", "works for", "worked at", "worked for", "working at", "employed by",
                "employee of", "joined", "hired by", "engineer at", "analyst at", "manager at",
            ],
            vec![],
            60,
            0.8,
        );
        self.add_pattern(
            Person,
            Organization,
            RelationType::WorksAt,
            false,
            vec!["hired", "employs", "appointed"],
            vec![],
            60,
            0.7,
        );
        self.add_pattern(
            Person,
            Organization,
            RelationType::CeoOf,
            true,
            vec![
                "ceo of", "ceo at", "chief executive of", "chief executive officer of",
                "president of", "chairman of",
            ],
            vec![],
            60,
            0.85,
        );

        // Founding
        self.add_pattern(
            Person,
            Organization,
            RelationType::Founded,
            true,
            vec!["founded", "co-founded", "cofounded", "started"],
            vec!["founded by", "co-founded by", "started by"],
            60,
            0.8,
        );
        self.add_pattern(
            Person,
            Organization,
            RelationType::Founded,
            false,
            vec!["founded by", "co-founded by", "started by"],
            vec![],
            60,
            0.8,
        );

        // Acquisitions
        self.add_pattern(
            Organization,
            Organization,
            RelationType::Acquired,
            true,
            vec!["acquired", "bought", "purchased", "takeover of"],
            vec!["acquired by", "bought by", "purchased by"],
            80,
            0.8,
        );
        self.add_pattern(
            Organization,
            Organization,
            RelationType::Acquired,
            false,
            vec!["acquired by", "bought by", "purchased by"],
            vec![],
            80,
            0.8,
        );

        // Places
        self.add_pattern(
            Organization,
            Location,
            RelationType::LocatedIn,
            true,
            vec![
                "based in", "headquartered in", "located in", "offices in", "headquarters in",
            ],
            vec![],
            60,
            0.8,
        );
        self.add_pattern(
            Person,
            Location,
            RelationType::LivesIn,
            true,
            vec!["lives in", "living in", "resides in", "moved to", "based in"],
            vec![],
            60,
            0.7,
        );
        self.add_pattern(
            Person,
            Location,
            RelationType::BornIn,
            true,
            vec!["born in"],
            vec![],
            60,
            0.85,
        );
    }

    /// Add a relation pattern
    #[allow(clippy::too_many_arguments)]
    pub fn add_pattern(
        &mut self,
        subject_type: EntityType,
        object_type: EntityType,
        relation: RelationType,
        subject_first: bool,
        keywords: Vec<&str>,
        exclusions: Vec<&str>,
        max_distance: usize,
        confidence: f32,
    ) {
        self.patterns.push(RelationPattern {
            subject_type,
            object_type,
            relation,
            subject_first,
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            exclusions: exclusions.iter().map(|s| s.to_string()).collect(),
            max_distance,
            confidence,
        });
    }

    /// Find relations between entities based on patterns
    fn find_pattern_relations(
        &self,
        text: &str,
        entities: &[ExtractedEntity],
    ) -> Vec<ExtractedRelation> {
        let mut relations: Vec<ExtractedRelation> = Vec::new();

        for pattern in &self.patterns {
            let (first_type, second_type) = if pattern.subject_first {
                (pattern.subject_type, pattern.object_type)
            } else {
                (pattern.object_type, pattern.subject_type)
            };

            for first in entities.iter().filter(|e| e.entity_type == first_type) {
                for second in entities.iter().filter(|e| e.entity_type == second_type) {
                    if second.start < first.end {
                        continue;
                    }
                    if second.start - first.end > pattern.max_distance {
                        continue;
                    }
                    let Some(between) = text.get(first.end..second.start) else {
                        continue;
                    };
                    if crosses_sentence(between) {
                        continue;
                    }

                    // The nearest entity of the right type takes the relation
                    let intervening = entities.iter().any(|e| {
                        e.entity_type == second_type
                            && e.start >= first.end
                            && e.end <= second.start
                    });
                    if intervening {
                        continue;
                    }

                    let context = normalize_context(between);
                    if !contains_any(&context, &pattern.keywords)
                        || contains_any(&context, &pattern.exclusions)
                    {
                        continue;
                    }

                    let (subject, object) = if pattern.subject_first {
                        (first, second)
                    } else {
                        (second, first)
                    };

                    let relation = ExtractedRelation {
                        subject: subject.clone(),
                        predicate: pattern.relation.to_string(),
                        object: object.clone(),
                        confidence: pattern.confidence,
                    };
                    push_unique(&mut relations, relation);
                }
            }
        }

        relations
    }
}

impl Default for RuleBasedRe {
    fn default() -> Self {
        Self::new()
    }
}

impl RelationExtractor for RuleBasedRe {
    fn extract(&self, text: &str, entities: &[ExtractedEntity]) -> Vec<ExtractedRelation> {
        self.find_pattern_relations(text, entities)
    }
}

fn crosses_sentence(between: &str) -> bool {
    if between.contains('\n') {
        return true;
    }
    let bytes = between.as_bytes();
    bytes.windows(2).any(|w| matches!(w[0], b'.' | b'!' | b'?') && w[1].is_ascii_whitespace())
}

/// Lowercase words separated by single spaces, padded on both ends
fn normalize_context(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    format!(" {} ", cleaned.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn contains_any(context: &str, phrases: &[String]) -> bool {
    phrases
        .iter()
        .any(|p| context.contains(&format!(" {} ", p.to_lowercase())))
}

/// Keep one relation per (subject, predicate, object), the most confident
fn push_unique(relations: &mut Vec<ExtractedRelation>, relation: ExtractedRelation) {
    let existing = relations.iter_mut().find(|r| {
        r.predicate == relation.predicate
            && (r.subject.start, r.subject.end) == (relation.subject.start, relation.subject.end)
            && (r.object.start, r.object.end) == (relation.object.start, relation.object.end)
    });

    match existing {
        Some(r) if r.confidence < relation.confidence => *r = relation,
        Some(_) => {}
        None => relations.push(relation),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ner::RuleBasedNer;
    use crate::EntityExtractor;

    fn create_entity(text: &str, full: &str, entity_type: EntityType) -> ExtractedEntity {
        let start = full.find(text).unwrap();
        ExtractedEntity {
            text: text.to_string(),
            entity_type,
            start,
            end: start + text.len(),
            confidence: 0.9,
        }
    }

    fn triples(relations: &[ExtractedRelation]) -> Vec<(String, String, String)> {
        relations
            .iter()
            .map(|r| (r.subject.text.clone(), r.predicate.clone(), r.object.text.clone()))
            .collect()
    }

    #[test]
    fn test_relation_type_display() {
        assert_eq!(RelationType::WorksAt.to_string(), "works_at");
        assert_eq!(RelationType::LocatedIn.as_str(), "located_in");
    }

    #[test]
    fn test_relation_type_from_str() {
        assert_eq!(RelationType::from_str("works at"), Some(RelationType::WorksAt));
        assert_eq!(RelationType::from_str("ceo_of"), Some(RelationType::CeoOf));
        assert_eq!(RelationType::from_str("unknown"), None);
    }

    #[test]
    fn test_works_at() {
        let re = RuleBasedRe::new();
        let text = "Jon Smith works at Acme Corp.";
        let entities = vec![
            create_entity("Jon Smith", text, EntityType::Person),
            create_entity("Acme Corp", text, EntityType::Organization),
        ];

        let relations = re.extract(text, &entities);
        assert_eq!(
            triples(&relations),
            vec![("Jon Smith".into(), "works_at".into(), "Acme Corp".into())]
        );
    }

    #[test]
    fn test_passive_acquisition_is_inverted() {
        let re = RuleBasedRe::new();
        let text = "Acme Corp was acquired by Initech Inc last year.";
        let entities = vec![
            create_entity("Acme Corp", text, EntityType::Organization),
            create_entity("Initech Inc", text, EntityType::Organization),
        ];

        let relations = re.extract(text, &entities);
        assert_eq!(
            triples(&relations),
            vec![("Initech Inc".into(), "acquired".into(), "Acme Corp".into())]
        );
    }

    #[test]
    fn test_no_relation_across_sentences() {
        let re = RuleBasedRe::new();
        let text = "Jon Smith left. He joined Acme Corp in May.";
        let entities = vec![
            create_entity("Jon Smith", text, EntityType::Person),
            create_entity("Acme Corp", text, EntityType::Organization),
        ];

        assert!(re.extract(text, &entities).is_empty());
    }

    #[test]
    fn test_nearest_object_wins() {
        let re = RuleBasedRe::new();
        let text = "Jon Smith works at Acme Corp and Mary Jones at Initech Inc.";
        let entities = vec![
            create_entity("Jon Smith", text, EntityType::Person),
            create_entity("Acme Corp", text, EntityType::Organization),
            create_entity("Mary Jones", text, EntityType::Person),
            create_entity("Initech Inc", text, EntityType::Organization),
        ];

        let relations = re.extract(text, &entities);
        assert_eq!(
            triples(&relations),
            vec![("Jon Smith".into(), "works_at".into(), "Acme Corp".into())]
        );
    }

    #[test]
    fn test_with_rule_based_ner() {
        let ner = RuleBasedNer::new();
        let re = RuleBasedRe::new();
        let text = "Acme Corp, based in Berlin, hired Jon Smith.";

        let entities = ner.extract(text);
        let found = triples(&re.extract(text, &entities));

        assert!(found.contains(&("Acme Corp".into(), "located_in".into(), "Berlin".into())));
        assert!(found.contains(&("Jon Smith".into(), "works_at".into(), "Acme Corp".into())));
        assert_eq!(found.len(), 2);
    }
}
