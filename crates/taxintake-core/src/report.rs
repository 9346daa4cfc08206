//! Forms analysis report

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
        }
    }
}

/// One deduplicated filing obligation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredForm {
    pub form: String,
    pub jurisdiction: String,
    pub priority: Priority,
    pub due_date: String,
    pub description: String,
    /// Every tag that requires this form
    pub contributing_tags: Vec<String>,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deadline {
    pub form: String,
    pub jurisdiction: String,
    pub due_date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    Pending,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub task: String,
    pub due_date: String,
    pub status: ChecklistStatus,
}

/// Provisional compliance report for specialist review
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub analysis_summary: String,
    pub required_forms: Vec<RequiredForm>,
    pub estimated_complexity: Complexity,
    pub recommendations: Vec<String>,
    pub next_steps: Vec<String>,
    pub priority_deadlines: Vec<Deadline>,
    pub compliance_checklist: Vec<ChecklistItem>,
    /// True when the report was produced without a usable analysis
    #[serde(default)]
    pub fallback: bool,
}

pub const CONSULT_PROFESSIONAL: &str = "Consult with a qualified tax professional";
pub const SCHEDULE_CONSULTATION: &str = "Schedule consultation with tax professional";

impl Report {
    /// Conservative report used when analysis could not be produced
    pub fn conservative_fallback() -> Self {
        Self {
            analysis_summary: "We could not complete a detailed analysis of your situation. \
                Based on the cross-border facts gathered, professional review is strongly advised."
                .to_string(),
            required_forms: Vec::new(),
            estimated_complexity: Complexity::High,
            recommendations: vec![
                CONSULT_PROFESSIONAL.to_string(),
                "Gather all relevant tax documents".to_string(),
            ],
            next_steps: vec![SCHEDULE_CONSULTATION.to_string()],
            priority_deadlines: Vec::new(),
            compliance_checklist: vec![ChecklistItem {
                task: SCHEDULE_CONSULTATION.to_string(),
                due_date: "Within 1 week".to_string(),
                status: ChecklistStatus::Pending,
            }],
            fallback: true,
        }
    }

    /// Report for an empty tag set
    pub fn no_tags() -> Self {
        Self {
            analysis_summary: "No tags provided for analysis.".to_string(),
            required_forms: Vec::new(),
            estimated_complexity: Complexity::Low,
            recommendations: vec![CONSULT_PROFESSIONAL.to_string()],
            next_steps: vec!["Please complete the intake process first.".to_string()],
            priority_deadlines: Vec::new(),
            compliance_checklist: vec![ChecklistItem {
                task: SCHEDULE_CONSULTATION.to_string(),
                due_date: "Within 1 week".to_string(),
                status: ChecklistStatus::Pending,
            }],
            fallback: false,
        }
    }

    pub fn forms_with_priority(&self, priority: Priority) -> impl Iterator<Item = &RequiredForm> {
        self.required_forms
            .iter()
            .filter(move |f| f.priority == priority)
    }

    /// Render for display in the conversation
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## Analysis Summary\n\n{}\n", self.analysis_summary);

        if !self.required_forms.is_empty() {
            let _ = writeln!(out, "## Required Tax Forms\n");
            for (priority, heading) in [
                (Priority::High, "High Priority"),
                (Priority::Medium, "Medium Priority"),
                (Priority::Low, "Lower Priority"),
            ] {
                let forms: Vec<_> = self.forms_with_priority(priority).collect();
                if forms.is_empty() {
                    continue;
                }
                let _ = writeln!(out, "### {}\n", heading);
                for form in forms {
                    let _ = writeln!(
                        out,
                        "- **{}** ({}) - due {}",
                        form.form,
                        form.jurisdiction.to_uppercase(),
                        form.due_date
                    );
                    if !form.description.is_empty() {
                        let _ = writeln!(out, "  - {}", form.description);
                    }
                    let _ = writeln!(out, "  - Why: {}", form.rationale);
                }
                out.push('\n');
            }
        }

        let _ = writeln!(
            out,
            "## Complexity Assessment\n\nEstimated complexity: **{}**\n",
            self.estimated_complexity.as_str().to_uppercase()
        );

        write_list(&mut out, "Key Recommendations", &self.recommendations);
        write_list(&mut out, "Immediate Next Steps", &self.next_steps);

        if !self.priority_deadlines.is_empty() {
            let _ = writeln!(out, "## Priority Deadlines\n");
            for d in &self.priority_deadlines {
                let _ = writeln!(
                    out,
                    "- {} ({}): {}",
                    d.form,
                    d.jurisdiction.to_uppercase(),
                    d.due_date
                );
            }
            out.push('\n');
        }

        if !self.compliance_checklist.is_empty() {
            let _ = writeln!(out, "## Compliance Checklist\n");
            for item in &self.compliance_checklist {
                let mark = match item.status {
                    ChecklistStatus::Done => "x",
                    ChecklistStatus::Pending => " ",
                };
                let _ = writeln!(out, "- [{}] {} (due {})", mark, item.task, item.due_date);
            }
        }

        out.trim_end().to_string()
    }
}

fn write_list(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "## {}\n", heading);
    for (i, item) in items.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, item);
    }
    out.push('\n');
}
