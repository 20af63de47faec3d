//! The per-turn `speech.context` payload.
//!
//! A named-section JSON document. The dynamic grammar builder contributes
//! the `dgi` section (reference grammars and phrase hints); recognizer
//! subtypes may install additional sections before a turn starts.

use serde::Serialize;
use serde_json::{Map, Value, json};

/// Builds the `dgi` (dynamic grammar) context section.
#[derive(Debug, Clone, Default)]
pub struct DynamicGrammarBuilder {
    reference_grammars: Vec<String>,
    phrases: Vec<String>,
}

impl DynamicGrammarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference a server-side grammar by id.
    pub fn add_reference_grammar(&mut self, grammar_id: impl Into<String>) {
        self.reference_grammars.push(grammar_id.into());
    }

    /// Add a phrase hint biasing recognition.
    pub fn add_phrase(&mut self, phrase: impl Into<String>) {
        self.phrases.push(phrase.into());
    }

    pub fn clear_phrases(&mut self) {
        self.phrases.clear();
    }

    pub fn clear_reference_grammars(&mut self) {
        self.reference_grammars.clear();
    }

    /// The `dgi` section, or `None` when nothing was registered.
    pub fn build(&self) -> Option<Value> {
        if self.reference_grammars.is_empty() && self.phrases.is_empty() {
            return None;
        }

        #[derive(Serialize)]
        struct PhraseItem<'a> {
            #[serde(rename = "Text")]
            text: &'a str,
        }

        let mut section = Map::new();
        if !self.reference_grammars.is_empty() {
            section.insert(
                "ReferenceGrammars".to_string(),
                json!(self.reference_grammars),
            );
        }
        if !self.phrases.is_empty() {
            let items: Vec<PhraseItem<'_>> = self
                .phrases
                .iter()
                .map(|p| PhraseItem { text: p })
                .collect();
            section.insert(
                "Groups".to_string(),
                json!([{ "Type": "Generic", "Items": items }]),
            );
        }
        Some(Value::Object(section))
    }
}

/// The named-section context document sent at the start of every turn.
#[derive(Debug, Clone, Default)]
pub struct SpeechContext {
    sections: Map<String, Value>,
}

impl SpeechContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_section(&mut self, name: impl Into<String>, value: Value) {
        self.sections.insert(name.into(), value);
    }

    pub fn get_section(&self, name: &str) -> Option<&Value> {
        self.sections.get(name)
    }

    /// Serialize with the grammar builder's `dgi` section merged in.
    pub fn to_json(&self, grammar: &DynamicGrammarBuilder) -> String {
        let mut sections = self.sections.clone();
        if let Some(dgi) = grammar.build() {
            sections.insert("dgi".to_string(), dgi);
        }
        Value::Object(sections).to_string()
    }
}
