//! Short labels summarising one member of a group.

use serde_json::Value;

pub const MAX_COMMAND_CHIP_CHARS: usize = 50;

const FILE_POINTERS: &[&str] = &[
    "/tool_input/file_path",
    "/tool_input/notebook_path",
    "/tool_input/path",
    "/file_path",
    "/file",
    "/path",
];

/// Derives a chip from a hook payload: a touched file name, else a shell command,
/// else a search pattern. Payloads of any other shape yield nothing.
pub fn derive_chip(payload: &Value) -> Option<String> {
    if let Some(name) = FILE_POINTERS
        .iter()
        .filter_map(|pointer| non_empty_str(payload, pointer))
        .find_map(file_name)
    {
        return Some(name);
    }

    if let Some(command) = non_empty_str(payload, "/tool_input/command") {
        return Some(truncate_command(command));
    }

    non_empty_str(payload, "/tool_input/pattern").map(str::to_string)
}

fn non_empty_str<'a>(payload: &'a Value, pointer: &str) -> Option<&'a str> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn file_name(path: &str) -> Option<String> {
    path.rsplit(['/', '\\'])
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}

fn truncate_command(command: &str) -> String {
    if command.chars().count() <= MAX_COMMAND_CHIP_CHARS {
        return command.to_string();
    }
    let head: String = command.chars().take(MAX_COMMAND_CHIP_CHARS).collect();
    format!("{head}...")
}
