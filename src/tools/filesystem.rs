//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径必须落在 root 下（禁止 ../ 逃逸与符号链接逃逸）；
//! ReadFileTool / WriteFileTool 基于 SafeFs 提供 read_file / write_file 能力。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::schema::parameters_schema;
use crate::tools::Tool;

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

    /// 解析已存在的路径（读取用）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let full = self.lexical(path)?;
        let canonical = full
            .canonicalize()
            .map_err(|_| format!("File not found: {}", path))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes sandbox: {}", path))
        }
    }

    /// 解析可能尚不存在的路径（写入用）：最近的已存在祖先必须在根下
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, String> {
        let full = self.lexical(path)?;
        let mut ancestor = full.as_path();
        while !ancestor.exists() {
            ancestor = ancestor
                .parent()
                .ok_or_else(|| format!("Path escapes sandbox: {}", path))?;
        }
        let canonical = ancestor
            .canonicalize()
            .map_err(|e| format!("Cannot resolve {}: {}", path, e))?;
        if !canonical.starts_with(&self.root_dir) {
            return Err(format!("Path escapes sandbox: {}", path));
        }
        if full.is_dir() {
            return Err(format!("Is a directory: {}", path));
        }
        Ok(full)
    }

    /// 词法归一化：拼到根下并消解 `.` / `..`，越过根即视为逃逸
    fn lexical(&self, path: &str) -> Result<PathBuf, String> {
        let path = path.trim();
        if path.is_empty() {
            return Err("Missing file_path".to_string());
        }
        let candidate = Path::new(path);
        let relative = if candidate.is_absolute() {
            candidate
                .strip_prefix(&self.root_dir)
                .map_err(|_| format!("Path escapes sandbox: {}", path))?
        } else {
            candidate
        };

        let mut out = self.root_dir.clone();
        let mut depth = 0usize;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    out.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(format!("Path escapes sandbox: {}", path));
                    }
                    out.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!("Path escapes sandbox: {}", path));
                }
            }
        }
        Ok(out)
    }

    pub async fn read_file(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| format!("Read failed: {}", e))
    }

    /// 写入文件（自动创建父目录），返回写入的字符数
    pub async fn write_file(&self, path: &str, content: &str) -> Result<usize, String> {
        let resolved = self.resolve_for_write(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Create directory failed: {}", e))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| format!("Write failed: {}", e))?;
        Ok(content.chars().count())
    }
}

fn check_encoding(encoding: Option<&str>) -> Result<(), String> {
    match encoding.map(|e| e.trim().to_ascii_lowercase()) {
        None => Ok(()),
        Some(e) if e == "utf-8" || e == "utf8" => Ok(()),
        Some(e) => Err(format!("Unsupported encoding: {}", e)),
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadFileArgs {
    /// Path to the file to read
    file_path: String,
    /// File encoding (default: utf-8)
    encoding: Option<String>,
}

/// read_file 工具：读取文本文件
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read content from a file"
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<ReadFileArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: ReadFileArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))?;
        check_encoding(args.encoding.as_deref())?;
        tracing::info!(path = %args.file_path, "read_file");
        self.fs.read_file(&args.file_path).await
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WriteFileArgs {
    /// Path where to write the file
    file_path: String,
    /// Content to write
    content: String,
    /// File encoding (default: utf-8)
    encoding: Option<String>,
}

/// write_file 工具：写入文本文件
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file"
    }

    fn parameters_schema(&self) -> Value {
        parameters_schema::<WriteFileArgs>()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args: WriteFileArgs =
            serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))?;
        check_encoding(args.encoding.as_deref())?;
        tracing::info!(path = %args.file_path, bytes = args.content.len(), "write_file");
        let written = self.fs.write_file(&args.file_path, &args.content).await?;
        Ok(format!(
            "Successfully wrote {} characters to {}",
            written, args.file_path
        ))
    }
}
