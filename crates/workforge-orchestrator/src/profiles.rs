use crate::types::Subtask;
use std::path::Path;
use workforge_core::Role;
use workforge_provider::GenerationRequest;

/// Prompting defaults for one role.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleProfile {
    pub role: Role,
    pub system_prompt: String,
    /// Per-role override. When unset each backend uses its own temperature.
    pub temperature: Option<f32>,
}

impl RoleProfile {
    /// Built-in profile, optionally with a configured system prompt.
    pub fn for_role(role: Role, system_prompt: Option<&str>) -> Self {
        let default_prompt = match role {
            Role::Executor => EXECUTOR_PROMPT,
            Role::Tester => TESTER_PROMPT,
            Role::Documenter => DOCUMENTER_PROMPT,
        };
        Self {
            role,
            system_prompt: system_prompt.unwrap_or(default_prompt).to_string(),
            temperature: None,
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Build the generation request for a claimed subtask.
    pub fn request_for(&self, subtask: &Subtask) -> GenerationRequest {
        let mut prompt = format!(
            "File: {}\nTask: {}\n",
            subtask.file_path, subtask.instruction
        );
        if let Some(context) = &subtask.context {
            prompt.push_str("\nImplementation under consideration:\n```\n");
            prompt.push_str(context);
            prompt.push_str("\n```\n");
        }
        if let Some(best) = &subtask.best {
            let failing: Vec<String> = best
                .evaluation
                .scores
                .iter()
                .filter(|s| !s.passed)
                .map(|s| format!("{} scored {:.2} (needs {:.2})", s.metric, s.score, s.threshold))
                .collect();
            if !failing.is_empty() {
                prompt.push_str(&format!(
                    "\nPrevious attempt {} was rejected: {}.\nPrevious attempt:\n```\n{}\n```\n",
                    subtask.rework_count,
                    failing.join("; "),
                    best.artifact.content
                ));
            }
        }
        prompt.push_str("\nRespond with the complete file content only.");

        let mut request = GenerationRequest::new(prompt).with_system_prompt(&self.system_prompt);
        request.temperature = self.temperature;
        request
    }
}

/// Where a role's artifact for `file_path` is written.
///
/// Executors write the file itself, testers `tests/<dir>/test_<name>` and
/// documenters `docs/<path>.md`. Distinct files never share an output path.
pub fn output_path(role: Role, file_path: &str) -> String {
    match role {
        Role::Executor => file_path.to_string(),
        Role::Tester => {
            let path = Path::new(file_path);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file_path.to_string());
            match path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                Some(dir) => format!("tests/{}/test_{name}", dir.to_string_lossy()),
                None => format!("tests/test_{name}"),
            }
        }
        Role::Documenter => format!("docs/{file_path}.md"),
    }
}

/// Instruction for a file found in the project structure.
pub fn executor_instruction(goal: &str, file_path: &str) -> String {
    format!("Implement `{file_path}` as part of the project: {goal}")
}

/// Instruction for a follow-on subtask.
pub fn follow_on_instruction(role: Role, file_path: &str) -> String {
    match role {
        Role::Tester => format!("Write unit tests covering the public behaviour of `{file_path}`."),
        Role::Documenter => format!("Document the purpose and usage of `{file_path}`."),
        Role::Executor => executor_instruction("", file_path),
    }
}

const EXECUTOR_PROMPT: &str = r#"You are the Executor in a code-generation workforce.

Your job is to write one source file of a larger project.

## Rules
- Produce the whole file, ready to save as-is
- Match the file's language from its extension
- Keep functions small and readable
- Never include explanations outside code comments
- If feedback lists failing quality metrics, fix those first"#;

const TESTER_PROMPT: &str = r#"You are the Tester in a code-generation workforce.

Your job is to write unit tests for a file that has already been accepted.

## Rules
- Use the idiomatic test framework for the file's language
- Cover normal cases, edge cases and error paths
- Tests must be deterministic and independent
- Produce the whole test file, ready to save as-is"#;

const DOCUMENTER_PROMPT: &str = r#"You are the Documenter in a code-generation workforce.

Your job is to write Markdown documentation for a file that has already been accepted.

## Rules
- Start with a one-paragraph summary of the file's purpose
- Document each public item with a short usage example
- Keep it accurate to the implementation you are given"#;
