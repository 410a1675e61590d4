use std::process::ExitCode;

use treegui::commands::command::Command;

/// Print the tree description as pretty JSON.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn run(root: &Command) -> Result<ExitCode, Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(&root.describe())?);
    Ok(ExitCode::SUCCESS)
}
