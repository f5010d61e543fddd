//! 消息模板渲染
//!
//! 模板文件为 `<templates_dir>/<template_id>.txt`，占位符写作 `{name}`。
//! 未知占位符原样保留；模板文件不存在时使用内置模板。

use anyhow::{anyhow, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::scanner::WatchedFile;
use crate::fingerprint::Fingerprint;

pub const EMAIL_SUBJECT: &str = "email_subject";
pub const EMAIL_BODY: &str = "email_body";

const DEFAULT_EMAIL_SUBJECT: &str = "New CDR file: {filename}";
const DEFAULT_EMAIL_BODY: &str = "New CDR file arrived: {filename}\n\
Changed: {changed}\n\
Size: {size} bytes\n";

pub type TemplateFields = BTreeMap<&'static str, String>;

/// 模板渲染接口
pub trait Renderer {
    fn render(&self, template_id: &str, fields: &TemplateFields) -> Result<String>;
}

pub struct TemplateRenderer {
    templates_dir: Option<PathBuf>,
}

impl TemplateRenderer {
    pub fn new(templates_dir: Option<PathBuf>) -> Self {
        Self { templates_dir }
    }

    fn load(&self, template_id: &str) -> Result<String> {
        if let Some(dir) = &self.templates_dir {
            let path = dir.join(format!("{}.txt", template_id));
            if path.is_file() {
                return fs::read_to_string(&path)
                    .map_err(|e| anyhow!("Failed to read template {}: {}", path.display(), e));
            }
        }

        match template_id {
            EMAIL_SUBJECT => Ok(DEFAULT_EMAIL_SUBJECT.to_string()),
            EMAIL_BODY => Ok(DEFAULT_EMAIL_BODY.to_string()),
            other => Err(anyhow!("Template not found: {}", other)),
        }
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, template_id: &str, fields: &TemplateFields) -> Result<String> {
        let template = self.load(template_id)?;
        Ok(substitute(&template, fields))
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"))
}

/// 替换 `{name}` 占位符
pub fn substitute(template: &str, fields: &TemplateFields) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures| {
            let key = &caps[1];
            fields
                .get(key)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// 文件元数据 -> 模板字段
pub fn file_fields(file: &WatchedFile, fingerprint: &Fingerprint) -> TemplateFields {
    let mut fields = TemplateFields::new();
    fields.insert("filename", file.file_name());
    fields.insert("path", file.path.display().to_string());
    fields.insert("size", file.size.to_string());
    fields.insert(
        "changed",
        file.modified_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
    );
    fields.insert("fingerprint", fingerprint.to_string());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn fields() -> TemplateFields {
        let mut f = TemplateFields::new();
        f.insert("filename", "cdr_20240101.csv".to_string());
        f.insert("size", "42".to_string());
        f
    }

    #[test]
    fn test_substitute_known_and_unknown() {
        assert_eq!(
            substitute("{filename} ({size} bytes) {unknown} {}", &fields()),
            "cdr_20240101.csv (42 bytes) {unknown} {}"
        );
    }

    #[test]
    fn test_builtin_templates() {
        let renderer = TemplateRenderer::default();
        assert_eq!(
            renderer.render(EMAIL_SUBJECT, &fields()).unwrap(),
            "New CDR file: cdr_20240101.csv"
        );
        let body = renderer.render(EMAIL_BODY, &fields()).unwrap();
        assert!(body.starts_with("New CDR file arrived: cdr_20240101.csv\n"));
        assert!(body.contains("Size: 42 bytes"));
    }

    #[test]
    fn test_template_dir_overrides_builtin() {
        let temp = tempdir().unwrap();
        fs::write(temp.path().join("email_subject.txt"), "Новый файл {filename}").unwrap();

        let renderer = TemplateRenderer::new(Some(temp.path().to_path_buf()));
        assert_eq!(
            renderer.render(EMAIL_SUBJECT, &fields()).unwrap(),
            "Новый файл cdr_20240101.csv"
        );
        // 未覆盖的模板仍使用内置
        assert!(renderer.render(EMAIL_BODY, &fields()).is_ok());
    }

    #[test]
    fn test_unknown_template_is_error() {
        assert!(TemplateRenderer::default().render("sms_body", &fields()).is_err());
    }

    #[test]
    fn test_file_fields() {
        let file = WatchedFile {
            path: PathBuf::from("/srv/cdr/a.cdr"),
            size: 7,
            modified_at: Utc::now(),
        };
        let fp = Fingerprint::from_hex("ab".repeat(32));
        let f = file_fields(&file, &fp);
        assert_eq!(f["filename"], "a.cdr");
        assert_eq!(f["size"], "7");
        assert_eq!(f["fingerprint"], fp.as_str());
        assert_eq!(f["changed"].len(), "2024-01-01 00:00:00".len());
    }
}
