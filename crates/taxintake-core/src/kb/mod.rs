//! Knowledge base: question bank, modules and tag catalog
//!
//! The catalog is loaded once at startup from two JSON documents, validated,
//! and resolved into an immutable structure shared by every session. Any
//! dangling reference fails the load; nothing is looked up by string at turn
//! time that was not resolved here first.

pub mod action;
pub mod graph;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use crate::error::KnowledgeBaseError;
use crate::report::Priority;
use crate::Result;

pub use action::{Action, ActionRef, RawAction};
pub use graph::QuestionGraph;

pub const INTAKE_FILE: &str = "intake.json";
pub const TAGS_FILE: &str = "tags.json";

// ---------------------------------------------------------------------------
// Raw documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawIntake {
    pub gating_questions: RawGatingSection,
    #[serde(default)]
    pub modules: BTreeMap<String, RawModule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawGatingSection {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub questions: Vec<RawQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawModule {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    /// Short name used by "Go to Module A" style actions
    #[serde(default)]
    pub alias: Option<String>,
    pub questions: Vec<RawQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawQuestion {
    pub id: String,
    pub question: String,
    pub action: RawAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTags {
    pub tag_definitions: BTreeMap<String, TagDefinition>,
}

// ---------------------------------------------------------------------------
// Resolved catalog
// ---------------------------------------------------------------------------

/// Where a question lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionOwner {
    Gating,
    Module(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub prompt: String,
    pub action: Action,
    pub owner: QuestionOwner,
}

impl Question {
    pub fn is_gating(&self) -> bool {
        self.owner == QuestionOwner::Gating
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub id: String,
    pub title: String,
    pub alias: Option<String>,
    /// Question ids in asking order
    pub questions: Vec<String>,
    /// Same questions as slots in the resolved question table
    #[serde(skip)]
    slots: Vec<usize>,
}

/// One form a tag requires in one jurisdiction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormRequirement {
    pub form: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Jurisdiction code (lowercase, e.g. "us", "ca") to required forms
    #[serde(default)]
    pub forms: BTreeMap<String, Vec<FormRequirement>>,
    #[serde(default)]
    pub why: String,
}

impl TagDefinition {
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Summary counts for a loaded catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeBaseStats {
    pub gating_questions: usize,
    pub modules: usize,
    pub module_questions: usize,
    pub tags: usize,
    pub jurisdictions: usize,
    pub graph_nodes: usize,
    pub graph_edges: usize,
}

/// Outcome of validating raw documents
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub errors: Vec<KnowledgeBaseError>,
    pub warnings: Vec<String>,
    pub stats: KnowledgeBaseStats,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn passes(&self, strict: bool) -> bool {
        self.is_valid() && (!strict || self.warnings.is_empty())
    }
}

/// Immutable, fully resolved knowledge base
#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    gating: Vec<String>,
    gating_slots: Vec<usize>,
    modules: Vec<Module>,
    module_index: HashMap<String, usize>,
    questions: Vec<Question>,
    question_index: HashMap<String, usize>,
    tags: BTreeMap<String, TagDefinition>,
    /// Module id to the slot of the gating question that activates it
    activators: HashMap<String, usize>,
    graph: QuestionGraph,
    warnings: Vec<String>,
}

impl KnowledgeBase {
    /// Resolve raw documents, failing on the first inconsistency
    pub fn from_raw(
        intake: RawIntake,
        tags: RawTags,
    ) -> std::result::Result<Self, KnowledgeBaseError> {
        let (kb, report) = Self::resolve(&intake, &tags);
        if let Some(err) = report.errors.into_iter().next() {
            return Err(err);
        }
        for warning in &report.warnings {
            tracing::warn!("Knowledge base: {}", warning);
        }
        tracing::info!(
            "Knowledge base loaded: {} gating questions, {} modules, {} tags",
            report.stats.gating_questions,
            report.stats.modules,
            report.stats.tags
        );
        Ok(kb)
    }

    /// Validate raw documents, collecting every error instead of stopping
    pub fn validate(intake: &RawIntake, tags: &RawTags) -> ValidationReport {
        Self::resolve(intake, tags).1
    }

    pub fn from_json_str(intake: &str, tags: &str) -> Result<Self> {
        let intake: RawIntake = serde_json::from_str(intake)?;
        let tags: RawTags = serde_json::from_str(tags)?;
        Ok(Self::from_raw(intake, tags)?)
    }

    /// Load `intake.json` and `tags.json` from a directory
    pub async fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let (intake, tags) = Self::read_raw(dir).await?;
        Ok(Self::from_raw(intake, tags)?)
    }

    /// Read both raw documents without resolving them
    pub async fn read_raw(dir: impl AsRef<Path>) -> Result<(RawIntake, RawTags)> {
        let dir = dir.as_ref();
        let intake = tokio::fs::read_to_string(dir.join(INTAKE_FILE)).await?;
        let tags = tokio::fs::read_to_string(dir.join(TAGS_FILE)).await?;
        Ok((serde_json::from_str(&intake)?, serde_json::from_str(&tags)?))
    }

    fn resolve(intake: &RawIntake, raw_tags: &RawTags) -> (Self, ValidationReport) {
        let mut report = ValidationReport::default();
        let mut graph = QuestionGraph::new();

        let tags: BTreeMap<String, TagDefinition> = raw_tags
            .tag_definitions
            .iter()
            .map(|(key, def)| {
                let mut def = def.clone();
                if def.id.is_empty() {
                    def.id = key.clone();
                }
                (key.clone(), def)
            })
            .collect();
        for id in tags.keys() {
            graph.add_tag(id);
        }

        let mut modules = Vec::new();
        let mut module_index = HashMap::new();
        let mut aliases = HashMap::new();
        for (key, raw) in &intake.modules {
            let id = raw.id.clone().unwrap_or_else(|| key.clone());
            if module_index.contains_key(&id) {
                report
                    .errors
                    .push(KnowledgeBaseError::DuplicateModule(id.clone()));
                continue;
            }
            if let Some(alias) = &raw.alias {
                aliases.insert(alias.to_lowercase(), id.clone());
            }
            graph.add_module(&id);
            module_index.insert(id.clone(), modules.len());
            modules.push(Module {
                id,
                title: raw.title.clone(),
                alias: raw.alias.clone(),
                questions: Vec::new(),
                slots: Vec::new(),
            });
        }

        let resolve_module = |reference: &str| -> Option<String> {
            if module_index.contains_key(reference) {
                return Some(reference.to_string());
            }
            aliases.get(&reference.to_lowercase()).cloned()
        };

        let mut questions: Vec<Question> = Vec::new();
        let mut question_index: HashMap<String, usize> = HashMap::new();
        let mut gating = Vec::new();
        let mut gating_slots = Vec::new();
        let mut activators = HashMap::new();

        let mut sections: Vec<(Option<String>, &Vec<RawQuestion>)> =
            vec![(None, &intake.gating_questions.questions)];
        for (key, raw) in &intake.modules {
            sections.push((Some(raw.id.clone().unwrap_or_else(|| key.clone())), &raw.questions));
        }

        for (owner, raw_questions) in sections {
            let section_name = owner.clone().unwrap_or_else(|| "gating".to_string());
            for (position, raw) in raw_questions.iter().enumerate() {
                if let Some(existing) = question_index.get(&raw.id).map(|slot| &questions[*slot]) {
                    let first = match &existing.owner {
                        QuestionOwner::Gating => "gating".to_string(),
                        QuestionOwner::Module(m) => m.clone(),
                    };
                    report.errors.push(KnowledgeBaseError::DuplicateQuestion {
                        id: raw.id.clone(),
                        first,
                        second: section_name.clone(),
                    });
                    continue;
                }

                let action = match raw.action.parse() {
                    Some(ActionRef::Tag(tag)) => {
                        if !tags.contains_key(&tag) {
                            report.errors.push(KnowledgeBaseError::DanglingTag {
                                question: raw.id.clone(),
                                tag,
                            });
                            continue;
                        }
                        Action::AssignTag(tag)
                    }
                    Some(ActionRef::Module(reference)) => match resolve_module(&reference) {
                        Some(module) => Action::ActivateModule(module),
                        None => {
                            report.errors.push(KnowledgeBaseError::DanglingModule {
                                question: raw.id.clone(),
                                module: reference,
                            });
                            continue;
                        }
                    },
                    None => {
                        report.errors.push(KnowledgeBaseError::UnknownAction {
                            question: raw.id.clone(),
                            action: raw.action.to_string(),
                        });
                        continue;
                    }
                };

                graph.add_question(owner.as_deref(), position, &raw.id, &action);

                let slot = questions.len();
                let question_owner = match &owner {
                    None => {
                        gating.push(raw.id.clone());
                        gating_slots.push(slot);
                        if let Action::ActivateModule(m) = &action {
                            activators.entry(m.clone()).or_insert(slot);
                        }
                        QuestionOwner::Gating
                    }
                    Some(module) => {
                        if let Some(idx) = module_index.get(module) {
                            modules[*idx].questions.push(raw.id.clone());
                            modules[*idx].slots.push(slot);
                        }
                        QuestionOwner::Module(module.clone())
                    }
                };

                question_index.insert(raw.id.clone(), slot);
                questions.push(Question {
                    id: raw.id.clone(),
                    prompt: raw.question.trim().to_string(),
                    action,
                    owner: question_owner,
                });
            }
        }

        if gating.is_empty() {
            report.errors.push(KnowledgeBaseError::NoGatingQuestions);
        }

        for tag in graph.unreferenced_tags() {
            report
                .warnings
                .push(format!("Tag '{}' is not assigned by any question", tag));
        }
        for module in graph.unreachable_modules() {
            report
                .warnings
                .push(format!("Module '{}' is not activated by any question", module));
        }
        if graph.has_activation_cycle() {
            report
                .warnings
                .push("Module activations form a cycle".to_string());
        }
        for module in &modules {
            if module.questions.is_empty() {
                report
                    .warnings
                    .push(format!("Module '{}' has no questions", module.id));
            }
        }

        let jurisdictions: BTreeSet<&String> =
            tags.values().flat_map(|t| t.forms.keys()).collect();
        report.stats = KnowledgeBaseStats {
            gating_questions: gating.len(),
            modules: modules.len(),
            module_questions: modules.iter().map(|m| m.questions.len()).sum(),
            tags: tags.len(),
            jurisdictions: jurisdictions.len(),
            graph_nodes: graph.node_count(),
            graph_edges: graph.edge_count(),
        };

        let kb = Self {
            gating,
            gating_slots,
            modules,
            module_index,
            questions,
            question_index,
            tags,
            activators,
            graph,
            warnings: report.warnings.clone(),
        };
        (kb, report)
    }

    /// Gating question ids in asking order
    pub fn gating_questions(&self) -> &[String] {
        &self.gating
    }

    /// Gating questions in asking order
    pub fn gating(&self) -> impl Iterator<Item = &Question> + '_ {
        self.gating_slots
            .iter()
            .filter_map(move |slot| self.questions.get(*slot))
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.question_index
            .get(id)
            .and_then(|slot| self.questions.get(*slot))
    }

    /// Questions of `module` in asking order, without per-id lookups
    pub fn module_questions<'a>(&'a self, module: &'a Module) -> impl Iterator<Item = &'a Question> + 'a {
        module
            .slots
            .iter()
            .filter_map(move |slot| self.questions.get(*slot))
    }

    pub fn module(&self, id: &str) -> Option<&Module> {
        self.module_index.get(id).map(|idx| &self.modules[*idx])
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn tag(&self, id: &str) -> Option<&TagDefinition> {
        self.tags.get(id)
    }

    pub fn has_tag(&self, id: &str) -> bool {
        self.tags.contains_key(id)
    }

    pub fn tags(&self) -> impl Iterator<Item = &TagDefinition> {
        self.tags.values()
    }

    /// Gating question that activates `module`, if any
    pub fn activator_of(&self, module: &str) -> Option<&Question> {
        self.activators
            .get(module)
            .and_then(|slot| self.questions.get(*slot))
    }

    /// Tags an answer to `question` may assign
    pub fn reachable_tags(&self, question: &str) -> BTreeSet<String> {
        self.graph.reachable_tags(question)
    }

    pub fn graph(&self) -> &QuestionGraph {
        &self.graph
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn stats(&self) -> KnowledgeBaseStats {
        let jurisdictions: BTreeSet<&String> =
            self.tags.values().flat_map(|t| t.forms.keys()).collect();
        KnowledgeBaseStats {
            gating_questions: self.gating.len(),
            modules: self.modules.len(),
            module_questions: self.modules.iter().map(|m| m.questions.len()).sum(),
            tags: self.tags.len(),
            jurisdictions: jurisdictions.len(),
            graph_nodes: self.graph.node_count(),
            graph_edges: self.graph.edge_count(),
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub const INTAKE: &str = r#"{
        "gating_questions": {
            "title": "Gating",
            "questions": [
                { "id": "g_us", "question": "Are you a U.S. citizen or U.S. green-card holder?", "action": "Go to Module A" },
                { "id": "g_biz", "question": "Do you own a business?", "action": "Go to Module business" }
            ]
        },
        "modules": {
            "residency": {
                "id": "residency", "title": "Residency", "alias": "A",
                "questions": [
                    { "id": "r_canada", "question": "Do you live in Canada?", "action": "Add tag `us_in_canada`" },
                    { "id": "r_filing", "question": "Do you file a U.S. return?", "action": "add tag: worldwide_filing" }
                ]
            },
            "business": {
                "id": "business", "title": "Business",
                "questions": [
                    { "id": "b_corp", "question": "Do you own a Canadian corporation?", "action": "Add tag `foreign_corp`" }
                ]
            }
        }
    }"#;

    pub const TAGS: &str = r#"{
        "tag_definitions": {
            "us_in_canada": { "id": "us_in_canada", "name": "U.S. person in Canada", "description": "Lives in Canada",
                "forms": { "us": [ { "form": "Form 1040", "note": "Worldwide return" } ], "ca": [ { "form": "T1 General", "note": "Resident return" } ] },
                "why": "Dual taxation" },
            "worldwide_filing": { "id": "worldwide_filing", "name": "Worldwide filing", "description": "Files U.S. return",
                "forms": { "us": [ { "form": "Form 1040", "note": "Annual return", "priority": "high" } ] },
                "why": "Citizenship-based taxation" },
            "foreign_corp": { "id": "foreign_corp", "name": "Foreign corporation", "description": "Owns a CCPC",
                "forms": { "us": [ { "form": "Form 5471", "note": "Information return", "priority": "high" } ] },
                "why": "Controlled foreign corporation" },
            "rsu_income": { "id": "rsu_income", "name": "RSU income", "description": "Vested RSUs",
                "forms": { "ca": [ { "form": "T1 General", "note": "Employment income" } ] },
                "why": "Sourcing" }
        }
    }"#;

    pub fn kb() -> KnowledgeBase {
        KnowledgeBase::from_json_str(INTAKE, TAGS).unwrap()
    }
}
