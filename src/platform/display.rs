//! 桌面展示命令 - 把通知交给外部程序（如 notify-send）

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{error, info};

use crate::error::PlatformError;
use crate::platform::NotificationRequest;

/// 外部展示命令，标题和正文作为最后两个参数追加
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl DisplayCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// 解析 "notify-send -u low" 形式的命令行
    pub fn parse(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    pub async fn show(&self, request: &NotificationRequest) -> Result<(), PlatformError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&request.title)
            .arg(&request.body)
            .output()
            .await
            .map_err(|e| PlatformError::unsupported(format!("cannot run {}: {}", self.program, e)))?;

        if output.status.success() {
            info!(program = %self.program, title = %request.title, "Notification handed to display command");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(program = %self.program, error = %stderr, "Display command failed");
            Err(PlatformError::other(stderr.trim().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command_line() {
        let cmd = DisplayCommand::parse("notify-send -u low").unwrap();
        assert_eq!(cmd.program, "notify-send");
        assert_eq!(cmd.args, vec!["-u", "low"]);
        assert!(DisplayCommand::parse("   ").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_show_runs_command() {
        let cmd = DisplayCommand::new("true");
        assert!(cmd.show(&NotificationRequest::new("t", "b")).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_show_reports_failure() {
        let cmd = DisplayCommand::new("false");
        assert!(cmd.show(&NotificationRequest::new("t", "b")).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_program_is_unsupported() {
        let cmd = DisplayCommand::new("definitely-not-a-real-notifier-binary");
        let err = cmd.show(&NotificationRequest::new("t", "b")).await.unwrap_err();
        assert_eq!(err.kind, crate::error::PlatformErrorKind::Unsupported);
    }
}
