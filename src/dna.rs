//! Project DNA loading, validation, and task extraction.
//!
//! A project is specified by three files in its directory:
//! - `idea.md`: free-text description of what to build
//! - `tech_stack.json`: runtime and dependency declarations
//! - `definition_of_done.md`: markdown checklist the Sentinel judges against
//!
//! The DNA is immutable once loaded. Hard validation errors block
//! queueing; warnings are advisory only.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::queue::ProjectId;
use crate::task::MidnightTask;
use crate::{mlog_debug, Error, Result};

/// Base priority for extracted tasks.
const BASE_PRIORITY: u32 = 100;

/// Each `## Section` header lowers subsequent task priority by this step.
const SECTION_PRIORITY_STEP: u32 = 10;

/// Characters of the DoD used for the synthesized catch-all task.
const CATCH_ALL_CHARS: usize = 500;

/// Declared technology stack, parsed from `tech_stack.json`.
///
/// Tolerant of extra keys: only `runtime` and `dependencies` carry
/// meaning for validation; everything else is preserved verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TechStack {
    pub runtime: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The three-file project specification, loaded once from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDna {
    pub idea: String,
    pub tech_stack: TechStack,
    pub definition_of_done: String,
}

/// Outcome of DNA validation.
///
/// `valid` holds exactly when `errors` is empty; warnings never
/// affect validity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnaValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Load the three DNA files from a project directory.
///
/// Fails with `Error::MissingFile` if any file is absent and
/// `Error::Parse` if `tech_stack.json` is malformed. Never fails for
/// content problems; those are `validate_dna`'s concern.
pub fn load_dna(path: &Path) -> Result<ProjectDna> {
    mlog_debug!("load_dna path={}", path.display());
    let idea = read_dna_file(path, "idea.md")?;
    let stack_raw = read_dna_file(path, "tech_stack.json")?;
    let definition_of_done = read_dna_file(path, "definition_of_done.md")?;

    let tech_stack: TechStack =
        serde_json::from_str(&stack_raw).map_err(|e| Error::Parse {
            file: "tech_stack.json".to_string(),
            reason: e.to_string(),
        })?;

    Ok(ProjectDna {
        idea,
        tech_stack,
        definition_of_done,
    })
}

fn read_dna_file(dir: &Path, name: &str) -> Result<String> {
    let file = dir.join(name);
    if !file.exists() {
        return Err(Error::MissingFile(name.to_string()));
    }
    Ok(std::fs::read_to_string(&file)?)
}

fn runtime_shape_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9_.-]+@\d+\.\d+\.\d+$").unwrap()
    })
}

/// Validate loaded DNA.
///
/// Hard errors (block queueing): idea shorter than 50 characters,
/// missing `runtime`, DoD shorter than 100 characters. Soft warnings:
/// empty dependency map, `runtime` not matching `name@x.y.z`, DoD
/// without checkbox syntax.
pub fn validate_dna(dna: &ProjectDna) -> DnaValidation {
    let mut validation = DnaValidation::default();

    if dna.idea.trim().chars().count() < 50 {
        validation
            .errors
            .push("idea.md must be at least 50 characters".to_string());
    }
    match &dna.tech_stack.runtime {
        None => validation
            .errors
            .push("tech_stack.json is missing \"runtime\"".to_string()),
        Some(runtime) if !runtime_shape_re().is_match(runtime) => validation.warnings.push(
            format!("runtime \"{}\" does not match name@x.y.z", runtime),
        ),
        Some(_) => {}
    }
    if dna.definition_of_done.trim().chars().count() < 100 {
        validation
            .errors
            .push("definition_of_done.md must be at least 100 characters".to_string());
    }

    if dna.tech_stack.dependencies.is_empty() {
        validation
            .warnings
            .push("tech_stack.json declares no dependencies".to_string());
    }
    if !dna.definition_of_done.contains("- [ ]") && !dna.definition_of_done.contains("- [x]") {
        validation
            .warnings
            .push("definition_of_done.md has no checkbox syntax".to_string());
    }

    validation.valid = validation.errors.is_empty();
    validation
}

/// Extract ordered tasks from the definition-of-done.
///
/// Each `## Section` header lowers the priority of subsequent tasks by
/// a fixed step (floored at 0). Each unchecked `- [ ] text` line
/// becomes a task titled `"<section>: <text>"`; immediately-following
/// indented sub-bullets become acceptance criteria. Dependencies are
/// inferred by keyword pairing and deduplicated. If the DoD has no
/// checkboxes, exactly one catch-all task covering its first 500
/// characters is synthesized.
pub fn extract_tasks(dna: &ProjectDna, project_id: ProjectId) -> Vec<MidnightTask> {
    let lines: Vec<&str> = dna.definition_of_done.lines().collect();
    let mut tasks: Vec<MidnightTask> = Vec::new();
    let mut section = String::new();
    let mut priority = BASE_PRIORITY;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_start();

        if let Some(header) = trimmed.strip_prefix("## ") {
            section = header.trim().to_string();
            priority = priority.saturating_sub(SECTION_PRIORITY_STEP);
            i += 1;
            continue;
        }

        // Only unchecked boxes become work; checked ones are already done.
        if !line.starts_with(char::is_whitespace) {
            if let Some(text) = trimmed.strip_prefix("- [ ]") {
                let text = text.trim();
                let description = if section.is_empty() {
                    text.to_string()
                } else {
                    format!("{}: {}", section, text)
                };
                let mut task = MidnightTask::new(project_id, description, priority);

                // Indented sub-bullets are acceptance criteria; stop at
                // the first non-indented line.
                let mut j = i + 1;
                while j < lines.len() {
                    let sub = lines[j];
                    if sub.starts_with(char::is_whitespace) {
                        if let Some(criterion) = sub.trim_start().strip_prefix("- ") {
                            task.acceptance_criteria.push(criterion.trim().to_string());
                        }
                        j += 1;
                    } else {
                        break;
                    }
                }
                tasks.push(task);
                i = j;
                continue;
            }
        }

        i += 1;
    }

    if tasks.is_empty() {
        let summary: String = dna
            .definition_of_done
            .chars()
            .take(CATCH_ALL_CHARS)
            .collect();
        tasks.push(MidnightTask::new(
            project_id,
            format!("Complete definition of done: {}", summary.trim()),
            BASE_PRIORITY,
        ));
        return tasks;
    }

    infer_dependencies(&mut tasks);
    tasks
}

/// Keyword pairing rules: a task whose description contains the first
/// keyword depends on every earlier task containing any of the paired
/// keywords. Deduplication and self-exclusion are handled by
/// `MidnightTask::add_dependency`.
const DEPENDENCY_RULES: &[(&str, &[&str])] = &[
    ("test", &["implement", "create", "add"]),
    ("deploy", &["test", "build"]),
    ("document", &["implement", "create"]),
    ("integrate", &["implement", "create"]),
    ("optimize", &["implement", "create"]),
    ("refactor", &["implement", "create"]),
];

fn infer_dependencies(tasks: &mut [MidnightTask]) {
    let lowered: Vec<String> = tasks
        .iter()
        .map(|t| t.description.to_lowercase())
        .collect();

    for i in 0..tasks.len() {
        for (trigger, prerequisites) in DEPENDENCY_RULES {
            if !lowered[i].contains(trigger) {
                continue;
            }
            for j in 0..i {
                if prerequisites.iter().any(|kw| lowered[j].contains(kw)) {
                    let dep = tasks[j].id;
                    tasks[i].add_dependency(dep);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const GOOD_IDEA: &str =
        "A command-line tool that synchronizes bookmarks across browsers and devices.";

    fn good_dod() -> String {
        [
            "# Definition of Done",
            "",
            "## Core",
            "- [ ] Implement bookmark sync engine",
            "  - handles add and delete",
            "  - conflict-free merges",
            "- [ ] Add export command",
            "",
            "## Quality",
            "- [ ] Test the sync engine",
            "- [ ] Document the CLI",
        ]
        .join("\n")
    }

    fn write_project(dir: &Path, idea: &str, stack: &str, dod: &str) {
        fs::write(dir.join("idea.md"), idea).unwrap();
        fs::write(dir.join("tech_stack.json"), stack).unwrap();
        fs::write(dir.join("definition_of_done.md"), dod).unwrap();
    }

    fn good_dna() -> ProjectDna {
        ProjectDna {
            idea: GOOD_IDEA.to_string(),
            tech_stack: TechStack {
                runtime: Some("node@20.11.1".to_string()),
                dependencies: BTreeMap::from([(
                    "commander".to_string(),
                    "^12.0.0".to_string(),
                )]),
                extra: BTreeMap::new(),
            },
            definition_of_done: good_dod(),
        }
    }

    // ========== load_dna Tests ==========

    #[test]
    fn test_load_dna_reads_all_three_files() {
        let dir = TempDir::new().unwrap();
        write_project(
            dir.path(),
            GOOD_IDEA,
            r#"{"runtime":"node@20.11.1","dependencies":{"a":"1.0.0"}}"#,
            &good_dod(),
        );

        let dna = load_dna(dir.path()).unwrap();
        assert_eq!(dna.idea, GOOD_IDEA);
        assert_eq!(dna.tech_stack.runtime.as_deref(), Some("node@20.11.1"));
        assert_eq!(dna.tech_stack.dependencies.len(), 1);
        assert!(dna.definition_of_done.contains("- [ ]"));
    }

    #[test]
    fn test_load_dna_missing_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("idea.md"), GOOD_IDEA).unwrap();

        let err = load_dna(dir.path()).unwrap_err();
        match err {
            Error::MissingFile(name) => assert_eq!(name, "tech_stack.json"),
            other => panic!("expected MissingFile, got {:?}", other),
        }
    }

    #[test]
    fn test_load_dna_malformed_json() {
        let dir = TempDir::new().unwrap();
        write_project(dir.path(), GOOD_IDEA, "{not json", &good_dod());

        let err = load_dna(dir.path()).unwrap_err();
        match err {
            Error::Parse { file, .. } => assert_eq!(file, "tech_stack.json"),
            other => panic!("expected Parse, got {:?}", other),
        }
    }

    #[test]
    fn test_load_dna_tolerates_extra_keys() {
        let dir = TempDir::new().unwrap();
        write_project(
            dir.path(),
            GOOD_IDEA,
            r#"{"language":"typescript","runtime":"node","testing":"vitest"}"#,
            &good_dod(),
        );

        let dna = load_dna(dir.path()).unwrap();
        assert_eq!(dna.tech_stack.runtime.as_deref(), Some("node"));
        assert_eq!(dna.tech_stack.extra.len(), 2);
    }

    // ========== validate_dna Tests ==========

    #[test]
    fn test_validate_good_dna() {
        let validation = validate_dna(&good_dna());
        assert!(validation.valid);
        assert!(validation.errors.is_empty());
    }

    #[test]
    fn test_valid_iff_no_errors() {
        // Warnings alone never invalidate.
        let mut dna = good_dna();
        dna.tech_stack.runtime = Some("node".to_string()); // shape warning
        dna.tech_stack.dependencies.clear(); // empty-deps warning

        let validation = validate_dna(&dna);
        assert!(validation.valid);
        assert!(validation.errors.is_empty());
        assert_eq!(validation.warnings.len(), 2);
    }

    #[test]
    fn test_short_idea_is_hard_error() {
        let mut dna = good_dna();
        dna.idea = "Too short".to_string();

        let validation = validate_dna(&dna);
        assert!(!validation.valid);
        assert!(validation.errors.iter().any(|e| e.contains("idea.md")));
    }

    #[test]
    fn test_missing_runtime_is_hard_error() {
        let mut dna = good_dna();
        dna.tech_stack.runtime = None;

        let validation = validate_dna(&dna);
        assert!(!validation.valid);
        assert!(validation.errors.iter().any(|e| e.contains("runtime")));
    }

    #[test]
    fn test_short_dod_is_hard_error() {
        let mut dna = good_dna();
        dna.definition_of_done = "- [ ] do it".to_string();

        let validation = validate_dna(&dna);
        assert!(!validation.valid);
    }

    #[test]
    fn test_dod_without_checkboxes_warns() {
        let mut dna = good_dna();
        dna.definition_of_done =
            "The tool must synchronize bookmarks reliably across at least two \
             browsers and survive intermittent connectivity without data loss."
                .to_string();

        let validation = validate_dna(&dna);
        assert!(validation.valid);
        assert!(validation
            .warnings
            .iter()
            .any(|w| w.contains("checkbox")));
    }

    // ========== extract_tasks Tests ==========

    #[test]
    fn test_extract_tasks_titles_and_sections() {
        let tasks = extract_tasks(&good_dna(), ProjectId::new());
        let titles: Vec<&str> = tasks.iter().map(|t| t.description.as_str()).collect();
        assert_eq!(
            titles,
            vec![
                "Core: Implement bookmark sync engine",
                "Core: Add export command",
                "Quality: Test the sync engine",
                "Quality: Document the CLI",
            ]
        );
    }

    #[test]
    fn test_extract_tasks_section_priority_step() {
        let tasks = extract_tasks(&good_dna(), ProjectId::new());
        // First section lowers from 100 to 90, second to 80.
        assert_eq!(tasks[0].priority, 90);
        assert_eq!(tasks[1].priority, 90);
        assert_eq!(tasks[2].priority, 80);
        assert_eq!(tasks[3].priority, 80);
    }

    #[test]
    fn test_priority_floors_at_zero() {
        let mut dod = String::from("x\n");
        for i in 0..15 {
            dod.push_str(&format!("## Section {}\n- [ ] implement part {}\n", i, i));
        }
        let mut dna = good_dna();
        dna.definition_of_done = dod;

        let tasks = extract_tasks(&dna, ProjectId::new());
        assert_eq!(tasks.last().unwrap().priority, 0);
    }

    #[test]
    fn test_acceptance_criteria_from_sub_bullets() {
        let tasks = extract_tasks(&good_dna(), ProjectId::new());
        assert_eq!(
            tasks[0].acceptance_criteria,
            vec!["handles add and delete", "conflict-free merges"]
        );
        assert!(tasks[1].acceptance_criteria.is_empty());
    }

    #[test]
    fn test_sub_bullets_stop_at_non_indented_line() {
        let mut dna = good_dna();
        dna.definition_of_done = [
            "## S",
            "- [ ] Implement the thing",
            "  - criterion one",
            "not a bullet",
            "  - orphaned bullet",
        ]
        .join("\n");

        let tasks = extract_tasks(&dna, ProjectId::new());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].acceptance_criteria, vec!["criterion one"]);
    }

    #[test]
    fn test_checked_boxes_are_skipped() {
        let mut dna = good_dna();
        dna.definition_of_done = [
            "## S",
            "- [x] Already done",
            "- [ ] Implement remaining work",
        ]
        .join("\n");

        let tasks = extract_tasks(&dna, ProjectId::new());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "S: Implement remaining work");
    }

    #[test]
    fn test_keyword_dependencies() {
        let tasks = extract_tasks(&good_dna(), ProjectId::new());
        // "Test the sync engine" depends on both implement/create/add tasks.
        assert_eq!(tasks[2].dependencies.len(), 2);
        assert!(tasks[2].dependencies.contains(&tasks[0].id));
        assert!(tasks[2].dependencies.contains(&tasks[1].id));
        // "Document the CLI" depends on implement/create tasks only.
        assert_eq!(tasks[3].dependencies, vec![tasks[0].id]);
    }

    #[test]
    fn test_dependencies_never_self_or_duplicate() {
        let tasks = extract_tasks(&good_dna(), ProjectId::new());
        for task in &tasks {
            assert!(!task.dependencies.contains(&task.id));
            let mut deduped = task.dependencies.clone();
            deduped.sort_by_key(|d| d.0);
            deduped.dedup();
            assert_eq!(deduped.len(), task.dependencies.len());
        }
    }

    #[test]
    fn test_extract_is_deterministic_for_identical_dod() {
        let a = extract_tasks(&good_dna(), ProjectId::new());
        let b = extract_tasks(&good_dna(), ProjectId::new());
        assert_eq!(a.len(), b.len());
        for (ta, tb) in a.iter().zip(&b) {
            assert_eq!(ta.description, tb.description);
            assert_eq!(ta.priority, tb.priority);
            assert_eq!(ta.acceptance_criteria, tb.acceptance_criteria);
            assert_eq!(ta.dependencies.len(), tb.dependencies.len());
        }
    }

    #[test]
    fn test_no_checkboxes_synthesizes_catch_all() {
        let mut dna = good_dna();
        dna.definition_of_done = "Ship a working bookmark synchronizer. ".repeat(30);

        let tasks = extract_tasks(&dna, ProjectId::new());
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0]
            .description
            .starts_with("Complete definition of done:"));
        // Catch-all covers at most the first 500 characters of the DoD.
        assert!(tasks[0].description.chars().count() <= CATCH_ALL_CHARS + 40);
        assert!(tasks[0].dependencies.is_empty());
    }
}
