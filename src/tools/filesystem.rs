//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! read_file / list_dir / search_files / write_file / delete_file 基于 SafeFs 实现。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::tools::schema::schema_of;
use crate::tools::{ExecutionContext, Tool, ToolCategory, ToolError, ToolOutput};

/// 单个文件读取上限
const MAX_READ_BYTES: u64 = 512 * 1024;
/// search_files 最多返回的匹配行
const MAX_MATCHES: usize = 200;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 已存在路径：规范化后必须在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let rel = path.trim_start_matches("./");
        let full = self.root_dir.join(rel);
        let canonical = full
            .canonicalize()
            .map_err(|_| ToolError::NotFound(path.to_string()))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(ToolError::PathEscape(path.to_string())) // 如 ../../etc/passwd
        }
    }

    /// 可能尚不存在的路径（写入目标）：按组件解析，拒绝绝对路径与越过根的 ..
    pub fn resolve_new(&self, path: &str) -> Result<PathBuf, ToolError> {
        let mut out = self.root_dir.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !out.pop() || !out.starts_with(&self.root_dir) {
                        return Err(ToolError::PathEscape(path.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(ToolError::PathEscape(path.to_string()));
                }
            }
        }
        if !out.starts_with(&self.root_dir) || out == self.root_dir {
            return Err(ToolError::PathEscape(path.to_string()));
        }
        // 已存在的上级目录可能是指向沙箱外的符号链接
        if let Some(parent) = out.parent().and_then(|p| p.canonicalize().ok()) {
            if !parent.starts_with(&self.root_dir) {
                return Err(ToolError::PathEscape(path.to_string()));
            }
        }
        Ok(out)
    }

    pub fn read_file(&self, path: &str) -> Result<String, ToolError> {
        let resolved = self.resolve(path)?;
        let meta = std::fs::metadata(&resolved).map_err(|e| ToolError::Io(e.to_string()))?;
        if meta.is_dir() {
            return Err(ToolError::InvalidArguments(format!("{path} is a directory")));
        }
        if meta.len() > MAX_READ_BYTES {
            return Err(ToolError::InvalidArguments(format!(
                "{path} is {} bytes, larger than the {} byte read limit",
                meta.len(),
                MAX_READ_BYTES
            )));
        }
        std::fs::read_to_string(&resolved).map_err(|e| ToolError::Io(format!("Read failed: {e}")))
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, ToolError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base).map_err(|e| ToolError::Io(format!("List failed: {e}")))? {
            let e = e.map_err(|e| ToolError::Io(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<usize, ToolError> {
        let target = self.resolve_new(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ToolError::Io(e.to_string()))?;
        }
        std::fs::write(&target, content).map_err(|e| ToolError::Io(format!("Write failed: {e}")))?;
        Ok(content.len())
    }

    pub fn delete_file(&self, path: &str) -> Result<(), ToolError> {
        let target = self.resolve(path)?;
        if target == self.root_dir {
            return Err(ToolError::PathEscape(path.to_string()));
        }
        if target.is_dir() {
            return Err(ToolError::InvalidArguments(format!("{path} is a directory")));
        }
        std::fs::remove_file(&target).map_err(|e| ToolError::Io(format!("Delete failed: {e}")))
    }

    /// 递归搜索包含 query 的行，返回 `path:line: text`
    pub fn search(&self, dir: &str, query: &str) -> Result<Vec<String>, ToolError> {
        let base = if dir.is_empty() || dir == "." {
            self.root_dir.clone()
        } else {
            self.resolve(dir)?
        };
        let mut matches = Vec::new();
        let mut stack = vec![base];
        while let Some(current) = stack.pop() {
            let Ok(read) = std::fs::read_dir(&current) else {
                continue;
            };
            let mut children: Vec<PathBuf> = read
                .filter_map(Result::ok)
                .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
                .map(|e| e.path())
                .collect();
            children.sort();
            for child in children.into_iter().rev() {
                if child.is_dir() {
                    stack.push(child);
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(&child) else {
                    continue;
                };
                let rel = child
                    .strip_prefix(&self.root_dir)
                    .unwrap_or(&child)
                    .to_string_lossy()
                    .to_string();
                for (i, line) in text.lines().enumerate() {
                    if line.contains(query) {
                        matches.push(format!("{}:{}: {}", rel, i + 1, line.trim()));
                        if matches.len() >= MAX_MATCHES {
                            return Ok(matches);
                        }
                    }
                }
            }
        }
        Ok(matches)
    }
}

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct PathArgs {
    /// 相对工作区根目录的路径
    path: String,
}

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct ListArgs {
    /// 目录路径，默认 "."
    path: Option<String>,
}

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct SearchArgs {
    /// 要查找的文本
    query: String,
    /// 搜索的目录，默认工作区根目录
    path: Option<String>,
}

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct WriteArgs {
    /// 相对工作区根目录的路径
    path: String,
    /// 写入的完整文件内容
    content: String,
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()).to_string())
}

/// 读取文件
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the workspace."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<PathArgs>()
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> Result<ToolOutput, String> {
        let args: PathArgs = parse_args(args)?;
        tracing::info!(path = %args.path, "read_file tool execute");
        let content = self.fs.read_file(&args.path).map_err(|e| e.to_string())?;
        let lines = content.lines().count();
        Ok(ToolOutput::ok(content).with_metadata(json!({ "path": args.path, "lines": lines })))
    }
}

/// 列出目录
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a workspace directory. Directories end with '/'."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<ListArgs>()
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Read
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> Result<ToolOutput, String> {
        let args: ListArgs = parse_args(args)?;
        let path = args.path.unwrap_or_else(|| ".".to_string());
        tracing::info!(path = %path, "list_dir tool execute");
        let entries = self.fs.list_dir(&path).map_err(|e| e.to_string())?;
        Ok(ToolOutput::ok(entries.join("\n")))
    }
}

/// 文本搜索
pub struct SearchFilesTool {
    fs: SafeFs,
}

impl SearchFilesTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        "search_files"
    }

    fn description(&self) -> &str {
        "Search workspace files for lines containing a text query. Returns path:line: text."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<SearchArgs>()
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Search
    }

    async fn execute(&self, args: Value, ctx: &ExecutionContext) -> Result<ToolOutput, String> {
        let args: SearchArgs = parse_args(args)?;
        let fs = self.fs.clone();
        let dir = args.path.unwrap_or_default();
        let query = args.query;
        let search = tokio::task::spawn_blocking(move || fs.search(&dir, &query));
        let matches = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err("search cancelled".to_string()),
            joined = search => joined.map_err(|e| e.to_string())?.map_err(|e| e.to_string())?,
        };
        if matches.is_empty() {
            return Ok(ToolOutput::ok("No matches found."));
        }
        let count = matches.len();
        Ok(ToolOutput::ok(matches.join("\n")).with_metadata(json!({ "matches": count })))
    }
}

/// 写入文件（覆盖）
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a workspace file with the given content."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<WriteArgs>()
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Write
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> Result<ToolOutput, String> {
        let args: WriteArgs = parse_args(args)?;
        tracing::info!(path = %args.path, bytes = args.content.len(), "write_file tool execute");
        let written = self.fs.write_file(&args.path, &args.content).map_err(|e| e.to_string())?;
        Ok(ToolOutput::ok(format!("Wrote {written} bytes to {}", args.path)))
    }
}

/// 删除文件（破坏性，默认需要确认）
pub struct DeleteFileTool {
    fs: SafeFs,
}

impl DeleteFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single workspace file."
    }

    fn parameters_schema(&self) -> Value {
        schema_of::<PathArgs>()
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Delete
    }

    async fn execute(&self, args: Value, _ctx: &ExecutionContext) -> Result<ToolOutput, String> {
        let args: PathArgs = parse_args(args)?;
        tracing::info!(path = %args.path, "delete_file tool execute");
        self.fs.delete_file(&args.path).map_err(|e| e.to_string())?;
        Ok(ToolOutput::ok(format!("Deleted {}", args.path)))
    }
}
