//! Stanford CoreNLP backend
//!
//! Sends document text to a CoreNLP server and maps its entity mentions and
//! OpenIE triples back onto byte spans of the original text. CoreNLP counts
//! offsets in UTF-16 code units.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::EntityType;
use serde::Deserialize;
use tracing::debug;

use crate::{AnnotateError, ExtractedEntity, ExtractedRelation, NlpBackend, RawAnnotation};

const ANNOTATORS: &str = "tokenize,ssplit,pos,lemma,ner,depparse,natlog,openie";

/// Labels that describe quantities rather than entities
const SKIPPED_LABELS: &[&str] = &[
    "NUMBER", "ORDINAL", "PERCENT", "DURATION", "SET", "TITLE", "EMAIL", "URL",
    "CAUSE_OF_DEATH", "CRIMINAL_CHARGE",
];

/// OpenIE triples carry no score of their own
const OPENIE_CONFIDENCE: f32 = 0.75;

pub struct CoreNlpBackend {
    client: reqwest::Client,
    url: String,
}

impl CoreNlpBackend {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, AnnotateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnnotateError::Init(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    fn properties() -> String {
        serde_json::json!({
            "annotators": ANNOTATORS,
            "outputFormat": "json",
            "openie.triple.strict": "true",
        })
        .to_string()
    }
}

#[async_trait]
impl NlpBackend for CoreNlpBackend {
    async fn annotate(&self, text: &str) -> Result<RawAnnotation, AnnotateError> {
        let resp = self
            .client
            .post(format!("{}/", self.url))
            .query(&[("properties", Self::properties())])
            .body(text.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    AnnotateError::Unavailable(e.to_string())
                } else {
                    AnnotateError::Backend(e.to_string())
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(if status.as_u16() == 503 {
                AnnotateError::Unavailable(format!("CoreNLP busy: {message}"))
            } else {
                AnnotateError::Backend(format!("CoreNLP error (status {status}): {message}"))
            });
        }

        let response: CoreNlpResponse = resp
            .json()
            .await
            .map_err(|e| AnnotateError::InvalidResponse(e.to_string()))?;

        let annotation = parse_response(text, response);
        debug!(
            entities = annotation.entities.len(),
            relations = annotation.relations.len(),
            "CoreNLP annotation"
        );
        Ok(annotation)
    }

    fn name(&self) -> &str {
        "corenlp"
    }
}

// ============================================================================
// Response model
// ============================================================================

#[derive(Debug, Deserialize)]
struct CoreNlpResponse {
    #[serde(default)]
    sentences: Vec<Sentence>,
}

#[derive(Debug, Deserialize)]
struct Sentence {
    #[serde(default)]
    tokens: Vec<Token>,
    #[serde(default)]
    entitymentions: Vec<EntityMention>,
    #[serde(default)]
    openie: Vec<Triple>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Token {
    character_offset_begin: usize,
    character_offset_end: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityMention {
    character_offset_begin: usize,
    character_offset_end: usize,
    ner: String,
    #[serde(default)]
    ner_confidences: HashMap<String, f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Triple {
    relation: String,
    subject_span: [usize; 2],
    object_span: [usize; 2],
}

/// Maps UTF-16 offsets onto byte offsets of the same text
struct Utf16Offsets {
    bytes: Vec<usize>,
}

impl Utf16Offsets {
    fn new(text: &str) -> Self {
        let mut bytes = Vec::with_capacity(text.len() + 1);
        for (byte, c) in text.char_indices() {
            for _ in 0..c.len_utf16() {
                bytes.push(byte);
            }
        }
        bytes.push(text.len());
        Self { bytes }
    }

    fn byte(&self, utf16: usize) -> Option<usize> {
        self.bytes.get(utf16).copied()
    }
}

fn parse_response(text: &str, response: CoreNlpResponse) -> RawAnnotation {
    let offsets = Utf16Offsets::new(text);
    let mut annotation = RawAnnotation::default();

    for sentence in response.sentences {
        let first_entity = annotation.entities.len();

        for mention in &sentence.entitymentions {
            if SKIPPED_LABELS.contains(&mention.ner.as_str()) {
                continue;
            }
            let (Some(start), Some(end)) = (
                offsets.byte(mention.character_offset_begin),
                offsets.byte(mention.character_offset_end),
            ) else {
                continue;
            };
            let Some(surface) = text.get(start..end) else {
                continue;
            };

            let confidence = mention
                .ner_confidences
                .values()
                .copied()
                .reduce(f32::max)
                .unwrap_or(0.9);

            annotation.entities.push(ExtractedEntity {
                text: surface.to_string(),
                entity_type: EntityType::from_label(&mention.ner),
                start,
                end,
                confidence,
            });
        }

        let entities = &annotation.entities[first_entity..];
        let mut relations = Vec::new();
        for triple in &sentence.openie {
            let subject = token_span(&sentence.tokens, triple.subject_span, &offsets)
                .and_then(|span| entity_for(entities, span));
            let object = token_span(&sentence.tokens, triple.object_span, &offsets)
                .and_then(|span| entity_for(entities, span));

            if let (Some(subject), Some(object)) = (subject, object) {
                if subject.start == object.start {
                    continue;
                }
                relations.push(ExtractedRelation {
                    subject: subject.clone(),
                    predicate: normalize_predicate(&triple.relation),
                    object: object.clone(),
                    confidence: OPENIE_CONFIDENCE,
                });
            }
        }
        annotation.relations.extend(relations);
    }

    annotation
}

/// Byte span covered by the tokens `[begin, end)` of a sentence
fn token_span(tokens: &[Token], span: [usize; 2], offsets: &Utf16Offsets) -> Option<(usize, usize)> {
    let [begin, end] = span;
    if begin >= end {
        return None;
    }
    let first = tokens.get(begin)?;
    let last = tokens.get(end - 1)?;
    Some((
        offsets.byte(first.character_offset_begin)?,
        offsets.byte(last.character_offset_end)?,
    ))
}

/// The entity that overlaps an argument span the most
fn entity_for(entities: &[ExtractedEntity], (start, end): (usize, usize)) -> Option<&ExtractedEntity> {
    entities
        .iter()
        .filter(|e| e.start < end && start < e.end)
        .max_by_key(|e| e.end.min(end) - e.start.max(start))
}

/// "works at" -> "works_at"
fn normalize_predicate(relation: &str) -> String {
    relation
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(value: serde_json::Value) -> CoreNlpResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_maps_utf16_offsets_to_bytes() {
        // "é" is one UTF-16 unit but two bytes
        let text = "Café: Jon Smith works at Acme.";
        let resp = response(serde_json::json!({
            "sentences": [{
                "tokens": [
                    {"characterOffsetBegin": 0, "characterOffsetEnd": 4},
                    {"characterOffsetBegin": 4, "characterOffsetEnd": 5},
                    {"characterOffsetBegin": 6, "characterOffsetEnd": 9},
                    {"characterOffsetBegin": 10, "characterOffsetEnd": 15},
                    {"characterOffsetBegin": 16, "characterOffsetEnd": 21},
                    {"characterOffsetBegin": 22, "characterOffsetEnd": 24},
                    {"characterOffsetBegin": 25, "characterOffsetEnd": 29},
                    {"characterOffsetBegin": 29, "characterOffsetEnd": 30}
                ],
                "entitymentions": [
                    {"characterOffsetBegin": 6, "characterOffsetEnd": 15, "ner": "PERSON",
                     "nerConfidences": {"PERSON": 0.98}},
                    {"characterOffsetBegin": 25, "characterOffsetEnd": 29, "ner": "ORGANIZATION"}
                ],
                "openie": [
                    {"subject": "Jon Smith", "subjectSpan": [2, 4], "relation": "works at",
                     "relationSpan": [4, 6], "object": "Acme", "objectSpan": [6, 7]}
                ]
            }]
        }));

        let annotation = parse_response(text, resp);

        assert_eq!(annotation.entities.len(), 2);
        let person = &annotation.entities[0];
        assert_eq!(person.text, "Jon Smith");
        assert_eq!((person.start, person.end), (7, 16));
        assert_eq!(person.entity_type, EntityType::Person);
        assert!((person.confidence - 0.98).abs() < f32::EPSILON);
        assert_eq!(annotation.entities[1].text, "Acme");
        assert_eq!(annotation.entities[1].confidence, 0.9);

        assert_eq!(annotation.relations.len(), 1);
        let rel = &annotation.relations[0];
        assert_eq!(rel.predicate, "works_at");
        assert_eq!(rel.subject.text, "Jon Smith");
        assert_eq!(rel.object.text, "Acme");
    }

    #[test]
    fn test_skips_quantities_and_fine_grained_labels() {
        let text = "Paris has 2 million people.";
        let resp = response(serde_json::json!({
            "sentences": [{
                "entitymentions": [
                    {"characterOffsetBegin": 0, "characterOffsetEnd": 5, "ner": "CITY"},
                    {"characterOffsetBegin": 10, "characterOffsetEnd": 19, "ner": "NUMBER"}
                ]
            }]
        }));

        let annotation = parse_response(text, resp);
        assert_eq!(annotation.entities.len(), 1);
        assert_eq!(annotation.entities[0].entity_type, EntityType::Location);
    }

    #[test]
    fn test_out_of_range_offsets_are_ignored() {
        let resp = response(serde_json::json!({
            "sentences": [{
                "entitymentions": [
                    {"characterOffsetBegin": 3, "characterOffsetEnd": 400, "ner": "PERSON"}
                ]
            }]
        }));
        assert!(parse_response("short", resp).entities.is_empty());
    }

    #[test]
    fn test_normalize_predicate() {
        assert_eq!(normalize_predicate("Was Founded  by"), "was_founded_by");
    }
}
