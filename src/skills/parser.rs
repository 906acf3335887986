//! Skill Parser
//!
//! Turns raw community content into a [`ParsedSkill`]. Best-effort: parsing
//! never fails, unrecognised content becomes an instruction-only skill.
//!
//! Accepted shapes, tried in order:
//!
//! ```toml
//! [skill]
//! name = "weather"
//! description = "Current weather for a city"
//!
//! [execution]
//! type = "script"          # or "shell", "instruction"
//! language = "python"
//! script = "print(city)"
//! ```
//!
//! ```markdown
//! ---
//! name: summarize
//! type: instruction
//! ---
//! # Summarize
//! Summarize {{text}} in three bullet points.
//! ```
//!
//! A bare script with a shebang line is also recognised as code.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

use super::types::{Language, ParsedSkill, SkillKind};

/// Parser collaborator contract
pub trait SkillParser: Send + Sync {
    /// Always returns something importable
    fn parse(&self, raw: &str) -> ParsedSkill;
}

/// Default parser for TOML manifests, Markdown skills and bare scripts
#[derive(Debug, Default, Clone)]
pub struct ManifestParser;

#[derive(Debug, Deserialize)]
struct Manifest {
    skill: ManifestSkill,
    #[serde(default)]
    execution: Option<ManifestExecution>,
}

#[derive(Debug, Deserialize)]
struct ManifestSkill {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct ManifestExecution {
    #[serde(rename = "type", default)]
    exec_type: Option<String>,
    language: Option<String>,
    script: Option<String>,
    command: Option<String>,
    prompt: Option<String>,
}

impl SkillParser for ManifestParser {
    fn parse(&self, raw: &str) -> ParsedSkill {
        if let Some(parsed) = parse_toml(raw) {
            debug!("Parsed TOML skill manifest: {}", parsed.name);
            return parsed;
        }
        if let Some(parsed) = parse_markdown(raw) {
            debug!("Parsed front-matter skill: {}", parsed.name);
            return parsed;
        }
        if let Some(parsed) = parse_shebang(raw) {
            debug!("Parsed bare script skill: {}", parsed.name);
            return parsed;
        }
        fallback(raw)
    }
}

fn parse_toml(raw: &str) -> Option<ParsedSkill> {
    let manifest: Manifest = toml::from_str(raw).ok()?;
    let name = slugify(&manifest.skill.name)?;
    let description = manifest.skill.description.trim().to_string();

    let Some(exec) = manifest.execution else {
        return Some(ParsedSkill {
            name,
            description,
            kind: SkillKind::InstructionOnly,
            source_body: String::new(),
        });
    };

    let exec_type = exec.exec_type.as_deref().unwrap_or("instruction").to_lowercase();
    let (kind, source_body) = match exec_type.as_str() {
        "script" => {
            let language = exec
                .language
                .as_deref()
                .and_then(Language::from_hint)
                .unwrap_or(Language::Python);
            (
                SkillKind::ExecutableCode { language },
                exec.script.unwrap_or_default(),
            )
        }
        "shell" => (
            SkillKind::ExecutableCode {
                language: Language::Shell,
            },
            exec.command.or(exec.script).unwrap_or_default(),
        ),
        _ => (
            SkillKind::InstructionOnly,
            exec.prompt.unwrap_or_default(),
        ),
    };

    Some(ParsedSkill {
        name,
        description,
        kind,
        source_body,
    })
}

fn parse_markdown(raw: &str) -> Option<ParsedSkill> {
    let rest = raw.trim_start().strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let header = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(|c| c != '\n').trim_start_matches('\n');

    let fields: HashMap<String, String> = header
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((
                key.trim().to_lowercase(),
                value.trim().trim_matches('"').trim_matches('\'').to_string(),
            ))
        })
        .collect();

    let name = fields
        .get("name")
        .and_then(|n| slugify(n))
        .or_else(|| first_heading(body).and_then(|h| slugify(&h)))
        .unwrap_or_else(|| "unnamed_skill".to_string());
    let description = fields
        .get("description")
        .cloned()
        .unwrap_or_else(|| first_paragraph(body));

    let declared = fields.get("type").or_else(|| fields.get("kind")).map(|t| t.to_lowercase());
    let language_hint = fields.get("language").and_then(|l| Language::from_hint(l));
    let block = fenced_block(body);

    let wants_code = match declared.as_deref() {
        Some("code" | "script" | "executable" | "executable-code" | "shell") => true,
        Some(_) => false,
        // Undeclared: code only when the body is nothing but one fenced block
        None => block
            .as_ref()
            .map(|(_, code)| body.trim().len() <= code.len() + 32)
            .unwrap_or(false),
    };

    let kind_and_body = if wants_code {
        block.and_then(|(fence_lang, code)| {
            let language = language_hint
                .or(fence_lang)
                .or_else(|| (declared.as_deref() == Some("shell")).then_some(Language::Shell))?;
            Some((SkillKind::ExecutableCode { language }, code))
        })
    } else {
        None
    };

    let (kind, source_body) = kind_and_body.unwrap_or((SkillKind::InstructionOnly, body.trim().to_string()));

    Some(ParsedSkill {
        name,
        description,
        kind,
        source_body,
    })
}

fn parse_shebang(raw: &str) -> Option<ParsedSkill> {
    let first = raw.lines().next()?.trim();
    let interpreter = first.strip_prefix("#!")?;
    let program = interpreter.split_whitespace().last()?.rsplit('/').next()?;
    let language = Language::from_hint(program.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.'))?;

    let comment_prefix = if language == Language::JavaScript { "//" } else { "#" };
    let name = raw
        .lines()
        .skip(1)
        .filter_map(|l| l.trim().strip_prefix(comment_prefix))
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(slugify)
        .unwrap_or_else(|| "unnamed_script".to_string());

    Some(ParsedSkill {
        name,
        description: String::new(),
        kind: SkillKind::ExecutableCode { language },
        source_body: raw.to_string(),
    })
}

fn fallback(raw: &str) -> ParsedSkill {
    let name = first_heading(raw)
        .or_else(|| raw.lines().map(str::trim).find(|l| !l.is_empty()).map(str::to_string))
        .and_then(|h| slugify(&h))
        .unwrap_or_else(|| "unnamed_skill".to_string());

    ParsedSkill {
        name,
        description: first_paragraph(raw),
        kind: SkillKind::InstructionOnly,
        source_body: raw.trim().to_string(),
    }
}

/// First fenced block: (language from info string, contents)
fn fenced_block(body: &str) -> Option<(Option<Language>, String)> {
    let start = body.find("```")?;
    let after = &body[start + 3..];
    let newline = after.find('\n')?;
    let info = after[..newline].trim();
    let content = &after[newline + 1..];
    let end = content.find("```")?;
    Some((Language::from_hint(info), content[..end].trim_end().to_string()))
}

fn first_heading(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| l.starts_with('#') && !l.starts_with("#!"))
        .map(|l| l.trim_start_matches('#').trim().to_string())
        .filter(|h| !h.is_empty())
}

fn first_paragraph(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("```"))
        .next()
        .map(|l| l.chars().take(200).collect())
        .unwrap_or_default()
}

/// Lowercase alphanumeric + underscore, at most 64 chars
fn slugify(s: &str) -> Option<String> {
    let mut out = String::new();
    for c in s.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') && !out.is_empty() {
            out.push('_');
        }
        if out.len() >= 64 {
            break;
        }
    }
    let out = out.trim_end_matches('_').to_string();
    (!out.is_empty()).then_some(out)
}
