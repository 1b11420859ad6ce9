//! Named Entity Recognition (NER) module
//!
//! Rule-based recognition for English text: regex patterns for names,
//! organisations, places, dates and amounts, plus a gazetteer of known
//! terms. Capitalised function words that open a sentence are skipped so
//! "Yesterday Jon Smith" still yields "Jon Smith".

use std::collections::HashMap;

use harvest_core::{EntityType, GazetteerEntry};
use regex::Regex;

use crate::{EntityExtractor, ExtractedEntity};

const MONTHS: &str =
    "January|February|March|April|May|June|July|August|September|October|November|December";

/// Capitalised words that never start or end a name
const STOP_TOKENS: &[&str] = &[
    "A", "About", "After", "Also", "An", "And", "As", "At", "Before", "But", "By", "During",
    "Earlier", "Every", "For", "From", "He", "Her", "His", "However", "I", "If", "In", "Its",
    "It", "Last", "Later", "Meanwhile", "Next", "Of", "On", "Or", "Our", "She", "Since", "So",
    "That", "The", "Their", "Then", "These", "They", "This", "Those", "To", "Today", "Tomorrow",
    "We", "When", "While", "With", "Yesterday", "Monday", "Tuesday", "Wednesday", "Thursday",
    "Friday", "Saturday", "Sunday", "January", "February", "March", "April", "May", "June",
    "July", "August", "September", "October", "November", "December",
];

/// Places recognised without configuration
const DEFAULT_LOCATIONS: &[(&str, &[&str])] = &[
    ("United States", &["USA", "U.S."]),
    ("United Kingdom", &["UK"]),
    ("New York", &["NYC"]),
    ("San Francisco", &[]),
    ("London", &[]),
    ("Paris", &[]),
    ("Berlin", &[]),
    ("Tokyo", &[]),
    ("Boston", &[]),
    ("Seattle", &[]),
    ("Chicago", &[]),
    ("Germany", &[]),
    ("France", &[]),
    ("Japan", &[]),
    ("China", &[]),
    ("India", &[]),
    ("Canada", &[]),
];

// ============================================================================
// Rule-based NER
// ============================================================================

struct Pattern {
    regex: Regex,
    entity_type: EntityType,
    confidence: f32,
    /// Capture group holding the entity (0 = whole match)
    group: usize,
    /// Skip matches that open or close with a stop token
    stop_tokens: bool,
}

/// Dictionary entry for entity matching
#[derive(Debug, Clone)]
pub struct DictionaryEntry {
    pub term: String,
    pub entity_type: EntityType,
    pub aliases: Vec<String>,
}

/// Rule-based NER using regex patterns and dictionaries
pub struct RuleBasedNer {
    patterns: Vec<Pattern>,
    /// Known terms (term -> entry)
    dictionary: HashMap<String, DictionaryEntry>,
    /// Compiled matchers for dictionary terms and aliases
    matchers: Vec<(Regex, EntityType, f32)>,
}

impl RuleBasedNer {
    /// Create a rule-based NER with the default English rules
    pub fn new() -> Self {
        let mut ner = Self {
            patterns: Vec::new(),
            dictionary: HashMap::new(),
            matchers: Vec::new(),
        };

        ner.init_patterns();
        for (term, aliases) in DEFAULT_LOCATIONS {
            ner.add_term(term, EntityType::Location, aliases.to_vec());
        }
        ner
    }

    /// Create with extra gazetteer terms on top of the defaults
    pub fn with_gazetteer(entries: &[GazetteerEntry]) -> Self {
        let mut ner = Self::new();
        for entry in entries {
            let aliases = entry.aliases.iter().map(String::as_str).collect();
            ner.add_term(&entry.term, EntityType::from_label(&entry.entity_type), aliases);
        }
        ner
    }

    fn init_patterns(&mut self) {
        // People
        self.add_pattern(
            r"\b(?:Mr|Mrs|Ms|Dr|Prof)\.?[ \t]+[A-Z][a-z]+(?:[ \t]+[A-Z][a-z]+)?\b",
            EntityType::Person,
            0.85,
            0,
            false,
        );
        self.add_pattern(
            r"\b[A-Z](?:[a-z]+|\.)(?:[ \t]+[A-Z]\.)?[ \t]+[A-Z][a-z]+(?:-[A-Z][a-z]+)?\b",
            EntityType::Person,
            0.6,
            0,
            true,
        );

        // Organisations by legal or institutional suffix
        self.add_pattern(
            r"\b[A-Z][A-Za-z0-9&]*(?:[ \t]+[A-Z][A-Za-z0-9&]*)*[ \t]+(?:Inc|Corp|Corporation|Co|Ltd|LLC|GmbH|Company|Group|Labs|Systems|Technologies|University|Institute|Foundation|Bank)\b",
            EntityType::Organization,
            0.85,
            0,
            true,
        );

        // Places after a locative preposition
        self.add_pattern(
            r"\b(?:in|from|near)[ \t]+([A-Z][a-z]+(?:[ \t]+[A-Z][a-z]+)?)\b",
            EntityType::Location,
            0.55,
            1,
            true,
        );

        // Dates
        self.add_pattern(
            &format!(r"\b(?:{MONTHS})[ \t]+\d{{1,2}}(?:st|nd|rd|th)?,?[ \t]+\d{{4}}\b"),
            EntityType::Date,
            0.95,
            0,
            false,
        );
        self.add_pattern(
            &format!(r"\b\d{{1,2}}[ \t]+(?:{MONTHS})[ \t]+\d{{4}}\b"),
            EntityType::Date,
            0.95,
            0,
            false,
        );
        self.add_pattern(
            &format!(r"\b(?:{MONTHS})[ \t]+\d{{4}}\b"),
            EntityType::Date,
            0.9,
            0,
            false,
        );
        self.add_pattern(r"\b\d{4}-\d{2}-\d{2}\b", EntityType::Date, 0.95, 0, false);
        self.add_pattern(r"\b(?:19|20)\d{2}\b", EntityType::Date, 0.7, 0, false);

        // Amounts
        self.add_pattern(
            r"[$€£]\d{1,3}(?:,\d{3})*(?:\.\d+)?(?:[ \t]+(?:thousand|million|billion|trillion))?\b",
            EntityType::Money,
            0.9,
            0,
            false,
        );
        self.add_pattern(
            r"\b\d+(?:\.\d+)?(?:[ \t]+(?:million|billion))?[ \t]+(?:dollars|euros|pounds|USD|EUR|GBP)\b",
            EntityType::Money,
            0.85,
            0,
            false,
        );
    }

    /// Add a regex pattern
    fn add_pattern(
        &mut self,
        pattern: &str,
        entity_type: EntityType,
        confidence: f32,
        group: usize,
        stop_tokens: bool,
    ) {
        if let Ok(regex) = Regex::new(pattern) {
            self.patterns.push(Pattern {
                regex,
                entity_type,
                confidence,
                group,
                stop_tokens,
            });
        }
    }

    /// Add a dictionary term, matched case-insensitively on word boundaries
    pub fn add_term(&mut self, term: &str, entity_type: EntityType, aliases: Vec<&str>) {
        let entry = DictionaryEntry {
            term: term.to_string(),
            entity_type,
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
        };

        if let Some(re) = term_matcher(term) {
            self.matchers.push((re, entity_type, 0.95));
        }
        for alias in &entry.aliases {
            if let Some(re) = term_matcher(alias) {
                self.matchers.push((re, entity_type, 0.9));
            }
        }

        self.dictionary.insert(term.to_string(), entry);
    }

    /// Look up a known term
    pub fn lookup(&self, term: &str) -> Option<&DictionaryEntry> {
        self.dictionary.get(term)
    }

    /// Extract entities using pattern matching
    fn extract_by_patterns(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut entities = Vec::new();

        for pattern in &self.patterns {
            let mut pos = 0;
            while pos < text.len() {
                let Some(caps) = pattern.regex.captures_at(text, pos) else {
                    break;
                };
                let Some(mat) = caps.get(pattern.group) else {
                    break;
                };

                if pattern.stop_tokens {
                    let matched = mat.as_str();
                    if let Some(skip) = leading_stop_token(matched) {
                        // Retry from the next token so the rest can still match
                        pos = mat.start() + skip;
                        continue;
                    }
                    if ends_with_stop_token(matched) {
                        pos = mat.end();
                        continue;
                    }
                }

                entities.push(ExtractedEntity {
                    text: mat.as_str().to_string(),
                    entity_type: pattern.entity_type,
                    start: mat.start(),
                    end: mat.end(),
                    confidence: pattern.confidence,
                });
                pos = mat.end();
            }
        }

        entities
    }

    /// Extract entities using dictionary lookup
    fn extract_by_dictionary(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut entities = Vec::new();

        for (regex, entity_type, confidence) in &self.matchers {
            for mat in regex.find_iter(text) {
                entities.push(ExtractedEntity {
                    text: mat.as_str().to_string(),
                    entity_type: *entity_type,
                    start: mat.start(),
                    end: mat.end(),
                    confidence: *confidence,
                });
            }
        }

        entities
    }

    /// Remove overlapping entities, keeping the longest then most confident
    fn deduplicate(&self, mut entities: Vec<ExtractedEntity>) -> Vec<ExtractedEntity> {
        entities.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then((b.end - b.start).cmp(&(a.end - a.start)))
                .then(b.confidence.total_cmp(&a.confidence))
        });

        let mut result: Vec<ExtractedEntity> = Vec::new();
        let mut covered_until = 0usize;

        for entity in entities {
            if entity.start < covered_until {
                continue;
            }
            covered_until = covered_until.max(entity.end);
            result.push(entity);
        }

        result
    }
}

impl Default for RuleBasedNer {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityExtractor for RuleBasedNer {
    fn extract(&self, text: &str) -> Vec<ExtractedEntity> {
        let mut entities = self.extract_by_patterns(text);
        entities.extend(self.extract_by_dictionary(text));
        self.deduplicate(entities)
    }
}

fn term_matcher(term: &str) -> Option<Regex> {
    let term = term.trim();
    if term.is_empty() {
        return None;
    }

    let word = |c: Option<char>| c.map(|c| c.is_alphanumeric()).unwrap_or(false);
    let open = if word(term.chars().next()) { r"\b" } else { "" };
    let close = if word(term.chars().last()) { r"\b" } else { "" };

    Regex::new(&format!("(?i){open}{}{close}", regex::escape(term))).ok()
}

/// Byte length of a leading stop token plus its trailing whitespace
fn leading_stop_token(matched: &str) -> Option<usize> {
    let first = matched.split_whitespace().next()?;
    if !STOP_TOKENS.contains(&first) {
        return None;
    }
    let rest = &matched[first.len()..];
    let skip = first.len() + (rest.len() - rest.trim_start().len());
    (skip < matched.len()).then_some(skip)
}

fn ends_with_stop_token(matched: &str) -> bool {
    matched
        .split_whitespace()
        .last()
        .map(|last| STOP_TOKENS.contains(&last))
        .unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================
