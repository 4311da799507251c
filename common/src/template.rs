use log::{debug, info};

use crate::{
    device_config::DeviceConfig,
    hal::{Filesystem, HalResult},
};

pub const SETUP_TEMPLATE: &str = "/setup.template.html";

pub fn output_path(template_path: &str) -> String {
    template_path.replacen(".template", "", 1)
}

const TOKENS: [&str; 4] = ["{hostname}", "{ssid}", "{ssid_pwd}", "{timestamp}"];

/// Substitutes the placeholder tokens in a single pass, so substituted values
/// are never scanned again. Values are HTML-escaped since they end up inside
/// attribute values of the setup form.
pub fn render(template: &str, config: &DeviceConfig, timestamp: &str) -> String {
    let mut html = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        html.push_str(&rest[..start]);
        let tail = &rest[start..];
        match TOKENS.iter().find(|token| tail.starts_with(**token)) {
            Some(token) => {
                match *token {
                    "{hostname}" => html.push_str(&escape_html(config.hostname())),
                    "{ssid}" => html.push_str(&escape_html(config.ssid().unwrap_or_default())),
                    "{ssid_pwd}" => {
                        html.push_str(&escape_html(config.ssid_password().unwrap_or_default()))
                    }
                    _ => html.push_str(timestamp),
                }
                rest = &tail[token.len()..];
            }
            None => {
                html.push('{');
                rest = &tail[1..];
            }
        }
    }
    html.push_str(rest);
    html
}

/// Regenerates the page next to `template_path`.
///
/// The page is written to `<output>.new` first and renamed over the old one.
/// The old page is only removed first when the filesystem refuses to rename
/// onto an existing file. Returns `Ok(false)` when the template does not exist.
pub fn rebuild(
    fs: &impl Filesystem,
    template_path: &str,
    config: &DeviceConfig,
    timestamp: &str,
) -> HalResult<bool> {
    let raw = match fs.read(template_path) {
        Ok(raw) => raw,
        Err(err) if err.is_not_found() => {
            debug!("template {template_path} missing, skipping rebuild");
            return Ok(false);
        }
        Err(err) => return Err(err),
    };

    let html = render(&String::from_utf8_lossy(&raw), config, timestamp);
    let output = output_path(template_path);
    let staging = format!("{output}.new");

    fs.write(&staging, html.as_bytes())?;
    if let Err(err) = fs.rename(&staging, &output) {
        debug!("rename onto {output} failed ({err}), removing it first");
        match fs.remove(&output) {
            Err(err) if !err.is_not_found() => return Err(err),
            _ => {}
        }
        fs.rename(&staging, &output)?;
    }

    info!("{output} rebuilt ({timestamp})");
    Ok(true)
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::MemoryFs;

    const TEMPLATE: &str =
        r#"<input value="{hostname}"><input value="{ssid}"><input value="{ssid_pwd}"><p>{timestamp}</p><p>{ssid}</p>"#;

    #[test]
    fn output_path_drops_template_suffix() {
        assert_eq!(output_path(SETUP_TEMPLATE), "/setup.html");
    }

    #[test]
    fn substitutes_every_occurrence() {
        let config = DeviceConfig::new("den", "HomeNet", "secret");
        assert_eq!(
            render(TEMPLATE, &config, "000001.000"),
            r#"<input value="den"><input value="HomeNet"><input value="secret"><p>000001.000</p><p>HomeNet</p>"#
        );
    }

    #[test]
    fn unset_fields_render_defaults_and_blanks() {
        let html = render("{hostname}|{ssid}|{ssid_pwd}", &DeviceConfig::default(), "t");
        assert_eq!(html, "lolin-ir-blaster||");
    }

    #[test]
    fn values_are_escaped() {
        let config = DeviceConfig::new("", "a\"b<c>", "");
        assert_eq!(render("{ssid}", &config, "t"), "a&quot;b&lt;c&gt;");
    }

    #[test]
    fn rebuild_is_idempotent_and_leaves_no_staging_file() {
        let fs = MemoryFs::default().with_file(SETUP_TEMPLATE, TEMPLATE.as_bytes());
        let config = DeviceConfig::new("den", "HomeNet", "secret");

        assert!(rebuild(&fs, SETUP_TEMPLATE, &config, "000010.000").unwrap());
        let first = fs.file("/setup.html").unwrap();
        assert!(rebuild(&fs, SETUP_TEMPLATE, &config, "000010.000").unwrap());
        let second = fs.file("/setup.html").unwrap();

        assert_eq!(first, second);
        assert!(!fs.exists("/setup.html.new"));
        assert_eq!(fs.file(SETUP_TEMPLATE).unwrap(), TEMPLATE.as_bytes());
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        let config = DeviceConfig::new("{ssid_pwd}", "{timestamp}", "secret");
        assert_eq!(
            render("{hostname}|{ssid}|{ssid_pwd}|{other}|{", &config, "t"),
            "{ssid_pwd}|{timestamp}|secret|{other}|{"
        );
    }

    #[test]
    fn rebuild_replaces_the_page_without_removing_it() {
        let fs = MemoryFs::default()
            .with_file(SETUP_TEMPLATE, TEMPLATE.as_bytes())
            .with_file("/setup.html", b"old");
        let config = DeviceConfig::new("den", "HomeNet", "secret");

        assert!(rebuild(&fs, SETUP_TEMPLATE, &config, "000010.000").unwrap());

        assert!(fs.removed().is_empty());
        assert!(fs.text("/setup.html").unwrap().contains("HomeNet"));
    }

    #[test]
    fn rebuild_falls_back_when_rename_cannot_replace() {
        let fs = MemoryFs::default()
            .rename_keeps_target()
            .with_file(SETUP_TEMPLATE, TEMPLATE.as_bytes())
            .with_file("/setup.html", b"old");
        let config = DeviceConfig::new("den", "HomeNet", "secret");

        assert!(rebuild(&fs, SETUP_TEMPLATE, &config, "000010.000").unwrap());

        assert_eq!(fs.removed(), vec!["/setup.html".to_string()]);
        assert!(fs.text("/setup.html").unwrap().contains("HomeNet"));
        assert!(!fs.exists("/setup.html.new"));
    }

    #[test]
    fn missing_template_is_skipped() {
        let fs = MemoryFs::default();
        assert!(!rebuild(&fs, SETUP_TEMPLATE, &DeviceConfig::default(), "t").unwrap());
        assert!(fs.paths().is_empty());
    }
}
