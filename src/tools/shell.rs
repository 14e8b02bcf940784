//! Shell 执行器：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词）；禁止 rm -rf、chmod 777 等子串；
//! 通过 sh -c 执行，返回 stdout / stderr / 退出码。

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use super::{Tool, ToolContext};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

/// Shell 工具：仅允许白名单内命令
pub struct ShellTool {
    allowed_commands: HashSet<String>,
    working_dir: Option<PathBuf>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            working_dir,
        }
    }

    /// 只取第一个 token 作为命令名
    fn command_name<'a>(&self, raw: &'a str) -> &'a str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {forbidden}"));
            }
        }
        let name = self.command_name(&raw_lower);
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{name}' not in allowlist"))
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute an allowlisted shell command and return stdout, stderr, and exit code"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (must be in allowlist)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.is_allowed(command)?;

        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("Execution failed: {e}"))?;

        Ok(json!({
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
            "exit_code": output.status.code(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::sync::Arc;

    fn ctx() -> ToolContext {
        ToolContext {
            task_id: "t1".into(),
            runtime: Arc::clone(&Runtime::new_in_memory(Default::default())),
        }
    }

    #[tokio::test]
    async fn test_allowlisted_command_runs() {
        let tool = ShellTool::new(vec!["echo".into()], None);
        let out = tool
            .execute(json!({ "command": "echo hello" }), &ctx())
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 0);
        assert!(out["stdout"].as_str().unwrap().contains("hello"));
    }

    #[tokio::test]
    async fn test_unlisted_command_rejected() {
        let tool = ShellTool::new(vec!["echo".into()], None);
        let err = tool
            .execute(json!({ "command": "python3 -c 'print(1)'" }), &ctx())
            .await
            .unwrap_err();
        assert!(err.contains("not in allowlist"));
    }

    #[tokio::test]
    async fn test_forbidden_pattern_rejected_even_when_allowlisted() {
        let tool = ShellTool::new(vec!["rm".into()], None);
        let err = tool
            .execute(json!({ "command": "rm -rf /" }), &ctx())
            .await
            .unwrap_err();
        assert!(err.contains("Forbidden pattern"));
    }
}
