//! Forms synthesis
//!
//! Turns a final tag set into one [`Report`]. Forms are keyed by
//! `(form, jurisdiction)`: a form required by several tags appears once and
//! its rationale names every contributing tag. The structure of the report
//! is always computed here; the completion service, when enabled, only
//! writes the narrative around it.

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::completion::ResilientCompletion;
use crate::kb::{KnowledgeBase, TagDefinition};
use crate::parser::parse_structured;
use crate::prompts;
use crate::report::{
    ChecklistItem, ChecklistStatus, Complexity, Deadline, Priority, Report, RequiredForm,
    CONSULT_PROFESSIONAL, SCHEDULE_CONSULTATION,
};

const OPTIONAL_HINTS: [&str; 4] = ["if ", "may ", "elect", "optional"];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NarrativeReply {
    analysis_summary: String,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    next_steps: Vec<String>,
}

fn default_due_date(jurisdiction: &str) -> &'static str {
    match jurisdiction {
        "us" => "April 15 (June 15 automatic extension when living abroad)",
        "ca" => "April 30",
        _ => "Per local filing calendar",
    }
}

fn jurisdiction_label(jurisdiction: &str) -> String {
    match jurisdiction {
        "us" => "U.S.".to_string(),
        "ca" => "Canada".to_string(),
        other => other.to_uppercase(),
    }
}

/// Accumulates one deduplicated form while tags are merged in
struct FormEntry {
    form: String,
    jurisdiction: String,
    explicit_priority: Option<Priority>,
    due_date: Option<String>,
    notes: Vec<String>,
    tags: Vec<String>,
    tag_names: Vec<String>,
}

impl FormEntry {
    fn priority(&self) -> Priority {
        if let Some(p) = self.explicit_priority {
            return p;
        }
        if self.tags.len() >= 2 {
            return Priority::High;
        }
        let optional = self.notes.iter().any(|n| {
            let lower = format!("{} ", n.to_lowercase());
            OPTIONAL_HINTS.iter().any(|hint| lower.contains(hint))
        });
        if optional {
            Priority::Low
        } else {
            Priority::Medium
        }
    }

    fn into_required(self) -> RequiredForm {
        let priority = self.priority();
        let cited: Vec<String> = self
            .tags
            .iter()
            .zip(&self.tag_names)
            .map(|(id, name)| format!("{} ({})", id, name))
            .collect();
        let rationale = if cited.len() == 1 {
            format!("Required by {}", cited[0])
        } else {
            format!("Required by {} facts: {}", cited.len(), cited.join(", "))
        };
        RequiredForm {
            due_date: self
                .due_date
                .unwrap_or_else(|| default_due_date(&self.jurisdiction).to_string()),
            description: self.notes.join("; "),
            form: self.form,
            jurisdiction: self.jurisdiction,
            priority,
            contributing_tags: self.tags,
            rationale,
        }
    }
}

/// Deterministic synthesis of the report structure
pub fn synthesize<'a, I>(tags: I, kb: &KnowledgeBase) -> Report
where
    I: IntoIterator<Item = &'a String>,
{
    let mut defs: Vec<&TagDefinition> = Vec::new();
    for id in tags {
        match kb.tag(id) {
            Some(def) if !defs.iter().any(|d| d.id == def.id) => defs.push(def),
            Some(_) => {}
            None => tracing::warn!("Ignoring unknown tag '{}' during synthesis", id),
        }
    }
    if defs.is_empty() {
        return Report::no_tags();
    }

    let mut entries: Vec<FormEntry> = Vec::new();
    let mut index: BTreeMap<(String, String), usize> = BTreeMap::new();
    for def in &defs {
        for (jurisdiction, forms) in &def.forms {
            for req in forms {
                let key = (req.form.clone(), jurisdiction.clone());
                let slot = *index.entry(key).or_insert_with(|| {
                    entries.push(FormEntry {
                        form: req.form.clone(),
                        jurisdiction: jurisdiction.clone(),
                        explicit_priority: None,
                        due_date: None,
                        notes: Vec::new(),
                        tags: Vec::new(),
                        tag_names: Vec::new(),
                    });
                    entries.len() - 1
                });
                let entry = &mut entries[slot];
                if let Some(p) = req.priority {
                    entry.explicit_priority = Some(entry.explicit_priority.map_or(p, |q| q.min(p)));
                }
                if entry.due_date.is_none() {
                    entry.due_date = req.due_date.clone();
                }
                if !req.note.is_empty() && !entry.notes.contains(&req.note) {
                    entry.notes.push(req.note.clone());
                }
                if !entry.tags.contains(&def.id) {
                    entry.tags.push(def.id.clone());
                    entry.tag_names.push(def.display_name().to_string());
                }
            }
        }
    }

    let mut required_forms: Vec<RequiredForm> =
        entries.into_iter().map(FormEntry::into_required).collect();
    required_forms.sort_by(|a, b| {
        (a.priority, &a.jurisdiction, &a.form).cmp(&(b.priority, &b.jurisdiction, &b.form))
    });

    let jurisdictions: BTreeSet<&str> = required_forms
        .iter()
        .map(|f| f.jurisdiction.as_str())
        .collect();
    let score = jurisdictions.len().max(1) * defs.len();
    let estimated_complexity = match score {
        0..=3 => Complexity::Low,
        4..=10 => Complexity::Medium,
        _ => Complexity::High,
    };

    let shared = required_forms
        .iter()
        .filter(|f| f.contributing_tags.len() > 1)
        .count();
    let names: Vec<&str> = defs.iter().map(|d| d.display_name()).collect();
    let labels: Vec<String> = jurisdictions.iter().map(|j| jurisdiction_label(j)).collect();
    let mut analysis_summary = format!(
        "Your situation combines {} cross-border facts ({}) that create filing obligations in {}. \
         Together they call for {} distinct forms",
        defs.len(),
        names.join(", "),
        if labels.is_empty() {
            "no specific jurisdiction".to_string()
        } else {
            labels.join(" and ")
        },
        required_forms.len()
    );
    if shared > 0 {
        analysis_summary.push_str(&format!(
            "; {} of them are required by more than one fact and are listed once",
            shared
        ));
    }
    analysis_summary.push('.');

    let mut recommendations = vec![CONSULT_PROFESSIONAL.to_string()];
    if jurisdictions.contains("us") && jurisdictions.contains("ca") {
        recommendations.push(
            "Coordinate the U.S. and Canadian returns so foreign tax credits are claimed in the right country"
                .to_string(),
        );
    }
    if required_forms.iter().any(|f| f.priority == Priority::High) {
        recommendations.push("File the high-priority forms first; penalties for late information returns can be significant".to_string());
    }
    if estimated_complexity == Complexity::High {
        recommendations.push("Engage a cross-border specialist rather than a single-country preparer".to_string());
    }

    let next_steps = vec![
        "Gather supporting documents for each listed form".to_string(),
        "Confirm the due dates that apply to your filing status".to_string(),
        SCHEDULE_CONSULTATION.to_string(),
    ];

    let priority_deadlines = required_forms
        .iter()
        .filter(|f| f.priority == Priority::High)
        .map(|f| Deadline {
            form: f.form.clone(),
            jurisdiction: f.jurisdiction.clone(),
            due_date: f.due_date.clone(),
        })
        .collect();

    let mut compliance_checklist: Vec<ChecklistItem> = required_forms
        .iter()
        .map(|f| ChecklistItem {
            task: format!("Prepare {} ({})", f.form, jurisdiction_label(&f.jurisdiction)),
            due_date: f.due_date.clone(),
            status: ChecklistStatus::Pending,
        })
        .collect();
    compliance_checklist.push(ChecklistItem {
        task: "Gather supporting documents".to_string(),
        due_date: "Within 2 weeks".to_string(),
        status: ChecklistStatus::Pending,
    });

    Report {
        analysis_summary,
        required_forms,
        estimated_complexity,
        recommendations,
        next_steps,
        priority_deadlines,
        compliance_checklist,
        fallback: false,
    }
}

#[derive(Debug, Clone)]
pub struct FormsSynthesizer {
    narrative: bool,
}

impl Default for FormsSynthesizer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FormsSynthesizer {
    pub fn new(narrative: bool) -> Self {
        Self { narrative }
    }

    /// Build the report, asking the completion service for the narrative
    ///
    /// Any failure of the narrative call yields the conservative fallback
    /// report instead of an error.
    pub async fn synthesize(
        &self,
        tags: &BTreeSet<String>,
        kb: &KnowledgeBase,
        completion: &ResilientCompletion,
    ) -> Report {
        let mut report = synthesize(tags, kb);
        if !self.narrative || report.required_forms.is_empty() {
            return report;
        }

        let defs: Vec<&TagDefinition> = tags.iter().filter_map(|t| kb.tag(t)).collect();
        let form_lines: Vec<String> = report
            .required_forms
            .iter()
            .map(|f| format!("{} ({}) - {}", f.form, f.jurisdiction.to_uppercase(), f.rationale))
            .collect();
        let (system, user) = prompts::report_narrative(&defs, &form_lines);

        let reply = match completion.complete(&system, &user).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Report narrative unavailable, using fallback report: {}", e);
                return Report::conservative_fallback();
            }
        };
        match parse_structured::<NarrativeReply>(&reply.content) {
            Ok(n) if !n.analysis_summary.trim().is_empty() => {
                report.analysis_summary = n.analysis_summary;
                if !n.recommendations.is_empty() {
                    report.recommendations = n.recommendations;
                }
                if !report.recommendations.iter().any(|r| r == CONSULT_PROFESSIONAL) {
                    report.recommendations.push(CONSULT_PROFESSIONAL.to_string());
                }
                if !n.next_steps.is_empty() {
                    report.next_steps = n.next_steps;
                }
                report
            }
            Ok(_) => {
                tracing::warn!("Report narrative was empty, using fallback report");
                Report::conservative_fallback()
            }
            Err(e) => {
                tracing::warn!("Rejected report narrative: {}", e);
                Report::conservative_fallback()
            }
        }
    }
}
