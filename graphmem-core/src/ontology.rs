// Copyright 2025 Graphmem (https://github.com/graphmem)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Ontology registry.
//!
//! Ontologies are TOML documents loaded once at startup. They declare the
//! entity and relation types the extractor may emit, extraction limits,
//! priority lists, and free-form instructions appended to the prompt.
//! A missing or malformed ontology fails startup.

use crate::error::{MemoryError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntityTypeDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
    /// "normal" or "high". High-priority types get a mandatory block in the prompt.
    #[serde(default = "default_priority")]
    pub priority: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelationTypeDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractionRules {
    #[serde(default = "default_max_entities")]
    pub max_entities: usize,
    #[serde(default = "default_max_relations")]
    pub max_relations: usize,
    #[serde(default)]
    pub priority_entities: Vec<String>,
    #[serde(default)]
    pub priority_relations: Vec<String>,
    /// Free-form instructions appended verbatim to the extraction prompt.
    #[serde(default)]
    pub special_instructions: String,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            max_entities: default_max_entities(),
            max_relations: default_max_relations(),
            priority_entities: Vec::new(),
            priority_relations: Vec::new(),
            special_instructions: String::new(),
        }
    }
}

fn default_priority() -> String {
    "normal".to_string()
}

fn default_max_entities() -> usize {
    30
}

fn default_max_relations() -> usize {
    40
}

/// An immutable ontology snapshot.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Ontology {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Domain preamble placed at the top of the extraction prompt.
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub entity_types: Vec<EntityTypeDef>,
    #[serde(default)]
    pub relation_types: Vec<RelationTypeDef>,
    #[serde(default)]
    pub extraction_rules: ExtractionRules,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Ontology {
    /// True if `entity_type` is one of the declared entity types
    /// (case-insensitive). Unknown types coerce to "Other" at parse time.
    pub fn knows_entity_type(&self, entity_type: &str) -> bool {
        self.entity_types
            .iter()
            .any(|et| et.name.eq_ignore_ascii_case(entity_type))
    }

    /// Canonical spelling for a declared entity type, or "Other".
    pub fn canonical_entity_type(&self, entity_type: &str) -> String {
        self.entity_types
            .iter()
            .find(|et| et.name.eq_ignore_ascii_case(entity_type))
            .map(|et| et.name.clone())
            .unwrap_or_else(|| "Other".to_string())
    }

    /// Build the extraction prompt for one chunk.
    ///
    /// `cumulative_context` is the compact JSON of entities and relations
    /// already extracted from prior chunks of the same document.
    pub fn build_prompt(&self, chunk_text: &str, cumulative_context: Option<&str>) -> String {
        let mut prompt = String::with_capacity(chunk_text.len() + 4096);

        if !self.context.trim().is_empty() {
            prompt.push_str(self.context.trim());
            prompt.push_str("\n\n");
        }

        let priority: Vec<&EntityTypeDef> = self
            .entity_types
            .iter()
            .filter(|et| {
                et.priority == "high"
                    || self.extraction_rules.priority_entities.contains(&et.name)
            })
            .collect();
        let others: Vec<&EntityTypeDef> = self
            .entity_types
            .iter()
            .filter(|et| !priority.iter().any(|p| p.name == et.name))
            .collect();

        if let Some(context) = cumulative_context {
            if !context.is_empty() {
                prompt.push_str("ALREADY EXTRACTED FROM EARLIER PARTS OF THIS DOCUMENT\n");
                prompt.push_str(
                    "Reuse these exact entity names when the same things reappear; \
                     do not re-describe them, only add genuinely new entities and relations.\n",
                );
                prompt.push_str(context);
                prompt.push_str("\n\n");
            }
        }

        prompt.push_str("DOCUMENT EXCERPT TO ANALYSE:\n---\n");
        prompt.push_str(chunk_text);
        prompt.push_str("\n---\n");

        if !priority.is_empty() {
            prompt.push_str("\nPRIORITY ENTITY TYPES - EXTRACTION MANDATORY:\n");
            for et in &priority {
                prompt.push_str(&format!("- {}: {}\n", et.name, et.description));
                if !et.examples.is_empty() {
                    prompt.push_str(&format!(
                        "  Examples: {}\n",
                        et.examples.iter().take(3).cloned().collect::<Vec<_>>().join(", ")
                    ));
                }
            }
            prompt.push_str("Extract every one of these that appears in the excerpt.\n");
        }

        prompt.push_str("\nENTITY TYPES:\n");
        for et in &others {
            prompt.push_str(&format!("- {}: {}\n", et.name, et.description));
            if !et.examples.is_empty() {
                prompt.push_str(&format!(
                    "  Examples: {}\n",
                    et.examples.iter().take(3).cloned().collect::<Vec<_>>().join(", ")
                ));
            }
        }

        prompt.push_str("\nRELATION TYPES:\n");
        for rt in &self.relation_types {
            prompt.push_str(&format!("- {}: {}\n", rt.name, rt.description));
        }

        if !self.extraction_rules.special_instructions.trim().is_empty() {
            prompt.push_str("\nSPECIAL INSTRUCTIONS (MANDATORY):\n");
            prompt.push_str(self.extraction_rules.special_instructions.trim());
            prompt.push('\n');
        }

        prompt.push_str(&format!(
            "\nSTRICT RULES:\n\
             1. At most {max_e} entities and {max_r} relations.\n\
             2. Entity names must be explicit and include their values (\"SLA 99.95%\", not \"SLA\").\n\
             3. Do not link every entity to the main organization; relate specific entities to \
             their own contents (clause to duration, article to obligation).\n\
             4. Prefer specific relation types over generic ones; a generic type is a last resort.\n",
            max_e = self.extraction_rules.max_entities,
            max_r = self.extraction_rules.max_relations,
        ));

        prompt.push_str(
            "\nAnswer ONLY with valid JSON in this exact shape:\n\
             {\n\
             \x20 \"entities\": [{\"name\": \"...\", \"type\": \"...\", \"description\": \"...\"}],\n\
             \x20 \"relations\": [{\"from_entity\": \"...\", \"to_entity\": \"...\", \"type\": \"...\", \"description\": \"...\"}],\n\
             \x20 \"summary\": \"two or three sentences\",\n\
             \x20 \"key_topics\": [\"...\"]\n\
             }\n",
        );

        prompt
    }
}

/// Registry of all ontologies loaded at startup. Read-only afterwards.
#[derive(Debug, Default)]
pub struct OntologyRegistry {
    ontologies: HashMap<String, Arc<Ontology>>,
}

impl OntologyRegistry {
    /// Load every `*.toml` in `dir`. A malformed file is a startup error.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut ontologies = HashMap::new();

        if !dir.is_dir() {
            return Err(MemoryError::invalid(format!(
                "ontology directory not found: {}",
                dir.display()
            )));
        }

        let entries = std::fs::read_dir(dir)
            .map_err(|e| MemoryError::Internal(format!("reading {}: {}", dir.display(), e)))?;

        for entry in entries {
            let entry =
                entry.map_err(|e| MemoryError::Internal(format!("reading ontology dir: {}", e)))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(|e| {
                MemoryError::Internal(format!("reading {}: {}", path.display(), e))
            })?;
            let ontology: Ontology = toml::from_str(&content).map_err(|e| {
                MemoryError::invalid(format!("malformed ontology {}: {}", path.display(), e))
            })?;
            if ontology.name.trim().is_empty() {
                return Err(MemoryError::invalid(format!(
                    "ontology {} has no name",
                    path.display()
                )));
            }
            tracing::info!(
                ontology = %ontology.name,
                version = %ontology.version,
                entity_types = ontology.entity_types.len(),
                relation_types = ontology.relation_types.len(),
                "Loaded ontology"
            );
            ontologies.insert(ontology.name.clone(), Arc::new(ontology));
        }

        Ok(Self { ontologies })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Ontology>> {
        self.ontologies.get(name).cloned()
    }

    /// Fetch an ontology or fail with the list of available names.
    pub fn get_or_err(&self, name: &str) -> Result<Arc<Ontology>> {
        self.get(name).ok_or_else(|| {
            let mut available: Vec<&str> =
                self.ontologies.keys().map(|s| s.as_str()).collect();
            available.sort_unstable();
            MemoryError::not_found(format!(
                "ontology '{}' not found; available: [{}]",
                name,
                available.join(", ")
            ))
        })
    }

    pub fn list(&self) -> Vec<serde_json::Value> {
        let mut out: Vec<_> = self
            .ontologies
            .values()
            .map(|ont| {
                serde_json::json!({
                    "name": ont.name,
                    "version": ont.version,
                    "description": ont.description.trim(),
                    "entity_types_count": ont.entity_types.len(),
                    "relation_types_count": ont.relation_types.len(),
                })
            })
            .collect();
        out.sort_by_key(|v| v["name"].as_str().unwrap_or_default().to_string());
        out
    }

    pub fn len(&self) -> usize {
        self.ontologies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ontologies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LEGAL: &str = r#"
        name = "legal"
        version = "1.2"
        description = "French legal documents"
        context = "You extract entities from French contracts."

        [[entity_types]]
        name = "Organization"
        description = "Company or institution"
        examples = ["Cloud Temple", "Acme"]
        priority = "high"

        [[entity_types]]
        name = "Date"
        description = "A calendar date"

        [[relation_types]]
        name = "SIGNED_BY"
        description = "Contract signed by an organization"

        [extraction_rules]
        max_entities = 20
        max_relations = 30
        special_instructions = "Extract every duration."
    "#;

    fn registry_with_legal() -> (tempfile::TempDir, OntologyRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("legal.toml")).unwrap();
        file.write_all(LEGAL.as_bytes()).unwrap();
        let registry = OntologyRegistry::load_dir(dir.path()).unwrap();
        (dir, registry)
    }

    #[test]
    fn loads_and_resolves_ontologies() {
        let (_dir, registry) = registry_with_legal();
        assert_eq!(registry.len(), 1);
        let legal = registry.get_or_err("legal").unwrap();
        assert_eq!(legal.version, "1.2");
        assert!(registry.get_or_err("missing").is_err());
    }

    #[test]
    fn malformed_ontology_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.toml"), "name = [not toml").unwrap();
        assert!(OntologyRegistry::load_dir(dir.path()).is_err());
    }

    #[test]
    fn entity_type_coercion() {
        let (_dir, registry) = registry_with_legal();
        let legal = registry.get("legal").unwrap();
        assert_eq!(legal.canonical_entity_type("organization"), "Organization");
        assert_eq!(legal.canonical_entity_type("Spaceship"), "Other");
        assert!(legal.knows_entity_type("date"));
    }

    #[test]
    fn prompt_contains_all_sections() {
        let (_dir, registry) = registry_with_legal();
        let legal = registry.get("legal").unwrap();
        let prompt = legal.build_prompt("Cloud Temple signe avec Acme.", Some("{\"entities\":[]}"));

        assert!(prompt.contains("You extract entities from French contracts."));
        assert!(prompt.contains("PRIORITY ENTITY TYPES"));
        assert!(prompt.contains("Organization"));
        assert!(prompt.contains("SIGNED_BY"));
        assert!(prompt.contains("Extract every duration."));
        assert!(prompt.contains("At most 20 entities and 30 relations"));
        assert!(prompt.contains("ALREADY EXTRACTED"));
        assert!(prompt.contains("Cloud Temple signe avec Acme."));
        // Output contract comes last so the model sees it nearest the answer.
        assert!(prompt.trim_end().ends_with("}"));
    }

    #[test]
    fn prompt_without_context_has_no_context_block() {
        let (_dir, registry) = registry_with_legal();
        let legal = registry.get("legal").unwrap();
        let prompt = legal.build_prompt("text", None);
        assert!(!prompt.contains("ALREADY EXTRACTED"));
    }
}
