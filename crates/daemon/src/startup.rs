use anyhow::{anyhow, Context, Result};
use regex::Regex;
use tokio::process::Command;
use tracing::info;

use crate::config::ToolSettings;

/// Versions of the external binaries we depend on, captured at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersions {
    pub ab_av1: String,
    pub ffprobe: String,
}

/// Verify ab-av1 and ffprobe resolve and answer a version probe. Run before
/// any stage starts; refusing to boot beats failing every queue item.
pub async fn check_external_tools(tool: &ToolSettings) -> Result<ToolVersions> {
    let ab_av1 = tool_version(&tool.ab_av1_bin, "--version")
        .await
        .with_context(|| {
            format!(
                "{} is required but unusable. Install with: cargo install ab-av1",
                tool.ab_av1_bin
            )
        })?;
    info!("found ab-av1 {}", ab_av1);

    let ffprobe = tool_version(&tool.ffprobe_bin, "-version")
        .await
        .with_context(|| format!("{} is required but unusable", tool.ffprobe_bin))?;
    info!("found ffprobe {}", ffprobe);

    Ok(ToolVersions { ab_av1, ffprobe })
}

async fn tool_version(bin: &str, flag: &str) -> Result<String> {
    let output = Command::new(bin)
        .arg(flag)
        .output()
        .await
        .with_context(|| format!("Failed to execute {} {}. Is it on PATH?", bin, flag))?;

    if !output.status.success() {
        return Err(anyhow!("{} {} exited non-zero", bin, flag));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(&stdout).ok_or_else(|| anyhow!("could not parse version from: {}", stdout))
}

/// Pull the first dotted version number out of a tool banner like
/// "ab-av1 0.7.18" or "ffprobe version 6.1.1-3ubuntu5".
pub fn parse_version(banner: &str) -> Option<String> {
    let re = Regex::new(r"(\d+\.\d+(?:\.\d+)?)").expect("version pattern");
    re.captures(banner).map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        assert_eq!(parse_version("ab-av1 0.7.18"), Some("0.7.18".to_string()));
        assert_eq!(
            parse_version("ffprobe version 6.1.1-3ubuntu5 Copyright (c)"),
            Some("6.1.1".to_string())
        );
        assert_eq!(
            parse_version("ffprobe version n7.0"),
            Some("7.0".to_string())
        );
        assert_eq!(parse_version("no digits here"), None);
    }
}
