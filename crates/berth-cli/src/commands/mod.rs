pub mod plan;
pub mod simulate;
pub mod validate;

use berth_core::ContainerState;
use berth_schema::{parse_definition_file, ContainerDefinition};
use std::path::Path;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_DEFINITION_ERROR: u8 = 2;

/// Prefix of every error message that maps to [`EXIT_DEFINITION_ERROR`].
pub const DEFINITION_ERROR_PREFIX: &str = "definition error:";

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Read, parse, and validate one definition file.
pub fn load_definition(path: &Path) -> Result<ContainerDefinition, String> {
    let definition = parse_definition_file(path)
        .map_err(|e| format!("{DEFINITION_ERROR_PREFIX} {}: {e}", path.display()))?;
    definition
        .validate()
        .map_err(|e| format!("{DEFINITION_ERROR_PREFIX} {}: {e}", path.display()))?;
    Ok(definition)
}

/// Split a `KEY=VALUE` command-line argument.
pub fn parse_assignment(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got '{input}'")),
    }
}

pub fn colorize_state(state: ContainerState) -> String {
    use console::Style;
    let text = state.as_str();
    match state {
        ContainerState::Running | ContainerState::ReadinessReady => {
            Style::new().green().apply_to(text).to_string()
        }
        ContainerState::Backoff
        | ContainerState::InvalidConfiguration
        | ContainerState::DependsFailed
        | ContainerState::ReadinessFailed => Style::new().red().bold().apply_to(text).to_string(),
        ContainerState::Dead | ContainerState::Killed => {
            Style::new().red().apply_to(text).to_string()
        }
        ContainerState::Drifted | ContainerState::Reconciling => {
            Style::new().yellow().apply_to(text).to_string()
        }
        ContainerState::PendingDelete => Style::new().dim().apply_to(text).to_string(),
        _ => Style::new().cyan().apply_to(text).to_string(),
    }
}
