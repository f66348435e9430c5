use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::{CollisionPolicy, EngineError, OperationRequest, OperationResult};
use crate::utils::path_security::{safe_join, validate_file_name};

/// One call produced by the natural-language front end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub operation_name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

impl CommandRecord {
    pub fn new(operation_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            operation_name: operation_name.into(),
            arguments: match arguments {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Requests to hand to the scheduler. May be empty (a pattern with no match).
    Run(Vec<OperationRequest>),
    UndoLast,
}

/// What became of one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutcome {
    pub operation_name: String,
    pub success: bool,
    pub results: Vec<OperationResult>,
    /// Set for records that never reached the scheduler, and for undo.
    pub error: Option<EngineError>,
    pub message: Option<String>,
}

impl CommandOutcome {
    pub fn from_results(operation_name: &str, results: Vec<OperationResult>) -> Self {
        Self {
            operation_name: operation_name.to_string(),
            success: results.iter().all(|r| r.success),
            results,
            error: None,
            message: None,
        }
    }

    pub fn rejected(operation_name: &str, error: EngineError) -> Self {
        Self {
            operation_name: operation_name.to_string(),
            success: false,
            results: Vec::new(),
            error: Some(error),
            message: None,
        }
    }
}

/// Turns command records into operation requests against one managed folder.
/// All paths are resolved under that folder; anything escaping it is rejected.
pub struct Interpreter {
    root: PathBuf,
}

impl Interpreter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn parse(&self, record: &CommandRecord) -> Result<Command, EngineError> {
        let args = &record.arguments;
        debug!("Parsing {} {:?}", record.operation_name, args);

        let requests = match record.operation_name.as_str() {
            "undo_last_operation" => return Ok(Command::UndoLast),
            "create_directory" => {
                let base = self.base(args, "base_path")?;
                vec![OperationRequest::create_dir(safe_join(&base, str_arg(args, "target_dir")?)?)]
            }
            "create_multiple_directories" => {
                let base = self.base(args, "base_path")?;
                list_arg(args, "directories")?
                    .iter()
                    .map(|d| Ok(OperationRequest::create_dir(safe_join(&base, d)?)))
                    .collect::<Result<Vec<_>, EngineError>>()?
            }
            "create_file" => {
                let mut path = self.resolve(str_arg(args, "file_path")?)?;
                if let Some(ext) = opt_str_arg(args, "extension") {
                    let ext = ext.trim_start_matches('.');
                    if !ext.is_empty() && path.extension().is_none() {
                        path.set_extension(ext);
                    }
                }
                let content = opt_str_arg(args, "content").map(str::to_string);
                vec![OperationRequest::create_file(path, content)]
            }
            "create_numbered_files" => self.numbered_files(args)?,
            "move_items" | "move_items_to_directory" | "perform_move_with_undo" => {
                let (items, dest) = self.items_and_destination(args)?;
                vec![OperationRequest::move_to(items, dest)]
            }
            "copy_items" | "copy_multiple_items" => {
                let (items, dest) = self.items_and_destination(args)?;
                vec![OperationRequest::copy_to(items, dest)]
            }
            "rename_item" => vec![self.rename(args)?],
            "rename_multiple_items" => {
                let items = args
                    .get("items")
                    .and_then(Value::as_array)
                    .ok_or_else(|| EngineError::validation("Missing argument: items"))?;
                items
                    .iter()
                    .map(|item| match item {
                        Value::Object(map) => self.rename(map),
                        _ => Err(EngineError::validation("Each rename needs old_path and new_name")),
                    })
                    .collect::<Result<Vec<_>, EngineError>>()?
            }
            "delete_item" | "delete_single_item" => {
                vec![OperationRequest::delete(vec![self.resolve(str_arg(args, "item_path")?)?])]
            }
            "delete_multiple_items" => {
                let paths = list_arg(args, "item_paths")?
                    .iter()
                    .map(|p| self.resolve(p))
                    .collect::<Result<Vec<_>, EngineError>>()?;
                vec![OperationRequest::delete(paths)]
            }
            "delete_items_by_pattern" => {
                let base = self.base(args, "target_dir")?;
                let matches = expand_pattern(&base, str_arg(args, "pattern")?)?;
                if matches.is_empty() {
                    Vec::new()
                } else {
                    vec![OperationRequest::delete(matches)]
                }
            }
            other => {
                warn!("Unsupported operation requested: {}", other);
                return Err(EngineError::UnsupportedOperation(other.to_string()));
            }
        };
        Ok(Command::Run(requests))
    }

    fn resolve(&self, input: &str) -> Result<PathBuf, EngineError> {
        safe_join(&self.root, input)
    }

    /// Optional sub-folder argument; the managed folder itself when absent.
    fn base(&self, args: &Map<String, Value>, key: &str) -> Result<PathBuf, EngineError> {
        match opt_str_arg(args, key) {
            Some(dir) if !dir.trim().is_empty() => self.resolve(dir),
            _ => Ok(self.root.clone()),
        }
    }

    fn items_and_destination(&self, args: &Map<String, Value>) -> Result<(Vec<PathBuf>, PathBuf), EngineError> {
        let items = list_arg(args, "items")?
            .iter()
            .map(|p| self.resolve(p))
            .collect::<Result<Vec<_>, EngineError>>()?;
        let dest = self.resolve(str_arg(args, "destination_dir")?)?;
        Ok((items, dest))
    }

    fn rename(&self, args: &Map<String, Value>) -> Result<OperationRequest, EngineError> {
        let old_path = self.resolve(str_arg(args, "old_path")?)?;
        let new_name = str_arg(args, "new_name")?.trim();
        validate_file_name(new_name)?;
        let parent = old_path
            .parent()
            .ok_or_else(|| EngineError::validation(format!("Cannot rename {}", old_path.display())))?;
        let new_path = parent.join(new_name);
        Ok(OperationRequest::rename(old_path, new_path).with_collision(CollisionPolicy::Fail))
    }

    fn numbered_files(&self, args: &Map<String, Value>) -> Result<Vec<OperationRequest>, EngineError> {
        let base_name = str_arg(args, "base_name")?.trim();
        validate_file_name(base_name)?;
        let extension = str_arg(args, "extension")?.trim().trim_start_matches('.');
        let count = int_arg(args, "count")?.ok_or_else(|| EngineError::validation("Missing argument: count"))?;
        let start = int_arg(args, "start_number")?.unwrap_or(1);
        if count == 0 {
            return Err(EngineError::validation("count must be at least 1"));
        }
        if count > MAX_NUMBERED_FILES {
            return Err(EngineError::validation(format!("At most {} files can be created at once", MAX_NUMBERED_FILES)));
        }

        let end = start
            .checked_add(count)
            .ok_or_else(|| EngineError::validation("start_number is too large"))?;

        let dir = self.base(args, "target_dir")?;
        Ok((start..end)
            .map(|n| {
                let name = if extension.is_empty() {
                    format!("{}_{}", base_name, n)
                } else {
                    format!("{}_{}.{}", base_name, n, extension)
                };
                OperationRequest::create_file(dir.join(name), Some(format!("This is {} number {}", base_name, n)))
            })
            .collect())
    }
}

const MAX_NUMBERED_FILES: u64 = 1000;

fn str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, EngineError> {
    opt_str_arg(args, key).ok_or_else(|| EngineError::validation(format!("Missing argument: {}", key)))
}

fn opt_str_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn int_arg(args: &Map<String, Value>, key: &str) -> Result<Option<u64>, EngineError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| EngineError::validation(format!("{} must be a non-negative integer", key))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| EngineError::validation(format!("{} must be a non-negative integer", key))),
        Some(_) => Err(EngineError::validation(format!("{} must be a non-negative integer", key))),
    }
}

/// Accepts a JSON array of strings, or a single string.
fn list_arg(args: &Map<String, Value>, key: &str) -> Result<Vec<String>, EngineError> {
    match args.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| EngineError::validation(format!("{} must contain only strings", key)))
            })
            .collect(),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        _ => Err(EngineError::validation(format!("Missing argument: {}", key))),
    }
}

/// Items in `dir` matching a glob. A match nested inside another match is
/// dropped since deleting the outer one removes it.
fn expand_pattern(dir: &Path, pattern: &str) -> Result<Vec<PathBuf>, EngineError> {
    let pattern = pattern.trim();
    if pattern.is_empty() || Path::new(pattern).is_absolute() || pattern.split(['/', '\\']).any(|c| c == "..") {
        return Err(EngineError::validation(format!("Invalid pattern: {:?}", pattern)));
    }

    let full = format!("{}/{}", glob::Pattern::escape(&dir.to_string_lossy()), pattern);
    let entries = glob::glob(&full).map_err(|e| EngineError::validation(format!("Invalid pattern {:?}: {}", pattern, e)))?;

    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if path.starts_with(dir) && path != dir => matches.push(path),
            Ok(_) => {}
            Err(e) => warn!("Skipping unreadable match: {}", e),
        }
    }
    matches.sort();

    let mut kept: Vec<PathBuf> = Vec::with_capacity(matches.len());
    let mut seen: HashSet<PathBuf> = HashSet::new();
    for path in matches {
        if kept.iter().any(|k| path.starts_with(k)) || !seen.insert(path.clone()) {
            continue;
        }
        kept.push(path);
    }
    Ok(kept)
}
