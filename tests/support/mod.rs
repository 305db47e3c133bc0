#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use serde_json::json;
use tally::transcript::Role;
use tempfile::TempDir;

/// JSONL transcript in a temp directory.
pub struct TranscriptFile {
    dir: TempDir,
    path: PathBuf,
    lines: Vec<(Role, String)>,
}

impl TranscriptFile {
    pub fn new() -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("chat.jsonl");
        fs::write(&path, "")?;
        Ok(Self {
            dir,
            path,
            lines: Vec::new(),
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn push(&mut self, role: Role, text: &str) -> std::io::Result<()> {
        self.lines.push((role, text.to_string()));
        self.flush()
    }

    pub fn push_all(&mut self, texts: &[&str]) -> std::io::Result<()> {
        for text in texts {
            self.lines.push((Role::Other, text.to_string()));
        }
        self.flush()
    }

    fn flush(&self) -> std::io::Result<()> {
        let mut out = String::new();
        for (index, (role, text)) in self.lines.iter().enumerate() {
            let role = match role {
                Role::Me => "self",
                Role::Other => "other",
            };
            out.push_str(&json!({ "index": index, "role": role, "text": text }).to_string());
            out.push('\n');
        }
        fs::write(&self.path, out)
    }
}

/// A 500-message chat mixing every built-in form with filler.
pub fn long_chat() -> Vec<String> {
    let mut texts = Vec::with_capacity(500);
    for i in 0..500 {
        let text = match i % 10 {
            0 => format!("[查看任务|t{}|巡逻{}|...|5]", i / 10, i),
            1 => format!("[接受任务|t{}|巡逻{}|...|5]", i / 10, i),
            2 => "使用了金币".to_string(),
            3 => format!("[购买物品|道具{}|2]", i % 7),
            4 => format!("[好友申请|u{}|路人{}]", i % 13, i % 13),
            5 => format!("[添加好友|u{}]", i % 11),
            6 => "获得了20积分".to_string(),
            7 => format!("[红包|rp{}|小明|6.66]", i / 10),
            8 => format!("[头像|u{}|https://img.example/{}.png]", i % 13, i),
            _ => format!("今天天气不错 {i}"),
        };
        texts.push(text);
    }
    texts
}
