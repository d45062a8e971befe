//! Fenced code-block extraction from completed generations.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBlock {
    pub language: String,
    pub code: String,
}

/// Scan `text` line by line for triple-backtick fences and collect the
/// enclosed blocks. The fence line's remainder becomes the language tag.
/// Unterminated or empty blocks are dropped.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut in_block = false;
    let mut language = String::new();
    let mut lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            if in_block {
                if !lines.is_empty() {
                    blocks.push(CodeBlock {
                        language: language.clone(),
                        code: lines.join("\n"),
                    });
                }
                in_block = false;
                language.clear();
                lines.clear();
            } else {
                in_block = true;
                language = line.trim().trim_start_matches("```").trim().to_string();
            }
        } else if in_block {
            lines.push(line);
        }
    }

    blocks
}
