//! Route table for the provisioning UI.
//!
//! Routing is pure: it reads static files and returns a response together with
//! the commands the loop must apply. Both the ESP and host HTTP servers call
//! [`route`] from their handlers and forward the commands as events.

use log::info;

use crate::hal::Filesystem;

pub const INDEX_PAGE: &str = "/index.html";
pub const SETUP_PAGE: &str = "/setup.html";

pub const CAPTIVE_PROBE_PATHS: [&str; 8] = [
    "/hotspot-detect.html",
    "/library/test/success.html",
    "/generate_204",
    "/gen_204",
    "/ncsi.txt",
    "/check_network_status.txt",
    "/connecttest.txt",
    "/fwlink",
];

const LONG_CACHE: &str = "max-age=604800";
const NO_STORE: &str = "no-store";
const CACHEABLE_EXTENSIONS: [&str; 4] = [".png", ".jpg", ".ico", ".svg"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub path: String,
    pub query: Option<String>,
}

impl HttpRequest {
    pub fn from_uri(uri: &str) -> Self {
        match uri.split_once('?') {
            Some((path, query)) => Self {
                path: path.to_string(),
                query: Some(query.to_string()),
            },
            None => Self {
                path: uri.to_string(),
                query: None,
            },
        }
    }

    pub fn url(&self) -> &str {
        &self.path
    }

    pub fn param(&self, key: &str) -> Option<String> {
        query_param(self.query.as_deref()?, key)
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.param(key).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpResponse {
    /// 302 to the given location.
    Redirect(&'static str),
    Asset {
        content_type: &'static str,
        cache_control: Option<&'static str>,
        body: Vec<u8>,
    },
    /// 404 `text/plain`.
    NotFound(String),
    /// 409 `text/plain`.
    Conflict(String),
}

impl HttpResponse {
    pub fn status(&self) -> u16 {
        match self {
            Self::Redirect(_) => 302,
            Self::Asset { .. } => 200,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebCommand {
    /// A client reached the portal; disarms the idle-AP reboot.
    Activity,
    Reboot,
    Save {
        hostname: String,
        ssid: String,
        ssid_pwd: String,
    },
    Load,
    Wipe {
        reboot: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub response: HttpResponse,
    pub commands: Vec<WebCommand>,
}

impl Routed {
    fn new(response: HttpResponse) -> Self {
        Self {
            response,
            commands: Vec::new(),
        }
    }

    fn with(mut self, command: WebCommand) -> Self {
        self.commands.push(command);
        self
    }
}

pub fn route(request: &HttpRequest, fs: &impl Filesystem) -> Routed {
    let path = request.path.as_str();

    let routed = match path {
        "/" => Routed::new(HttpResponse::Redirect(INDEX_PAGE)).with(WebCommand::Activity),
        "/setup" => Routed::new(serve_file(fs, SETUP_PAGE, path, None)),
        "/reboot" => Routed::new(HttpResponse::Redirect(INDEX_PAGE)).with(WebCommand::Reboot),
        "/save" => Routed::new(HttpResponse::Redirect(INDEX_PAGE)).with(WebCommand::Save {
            hostname: request.param("hostname").unwrap_or_default(),
            ssid: request.param("ssid").unwrap_or_default(),
            ssid_pwd: request.param("ssid_pwd").unwrap_or_default(),
        }),
        "/load" => Routed::new(HttpResponse::Redirect(INDEX_PAGE)).with(WebCommand::Load),
        "/wipe" => Routed::new(HttpResponse::Redirect(INDEX_PAGE)).with(WebCommand::Wipe {
            reboot: !request.has_param("noreboot"),
        }),
        probe if CAPTIVE_PROBE_PATHS.contains(&probe) => {
            Routed::new(serve_file(fs, INDEX_PAGE, path, None)).with(WebCommand::Activity)
        }
        _ => Routed::new(serve_file(fs, path, path, Some(cache_policy(path))))
            .with(WebCommand::Activity),
    };

    match &routed.response {
        HttpResponse::NotFound(body) => info!("{body}"),
        _ => info!("{path} handled"),
    }

    routed
}

fn serve_file(
    fs: &impl Filesystem,
    file: &str,
    url: &str,
    cache_control: Option<&'static str>,
) -> HttpResponse {
    let not_found = || HttpResponse::NotFound(format!("{url} Not found!"));

    if !file.starts_with('/') || file.split('/').any(|segment| segment == "..") {
        return not_found();
    }

    match fs.read(file) {
        Ok(body) => HttpResponse::Asset {
            content_type: content_type_for(file),
            cache_control,
            body,
        },
        Err(_) => not_found(),
    }
}

pub fn cache_policy(path: &str) -> &'static str {
    let lower = path.to_ascii_lowercase();
    if CACHEABLE_EXTENSIONS.iter().any(|ext| lower.contains(ext)) {
        LONG_CACHE
    } else {
        NO_STORE
    }
}

pub fn content_type_for(path: &str) -> &'static str {
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

pub fn query_param(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(percent_decode(&value.replace('+', " ")));
        }
    }

    None
}

/// Invalid escapes are kept literally.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[index + 1..index + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                index += 3;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::testing::MemoryFs;

    fn fs() -> MemoryFs {
        MemoryFs::default()
            .with_file(INDEX_PAGE, b"<h1>index</h1>")
            .with_file(SETUP_PAGE, b"<form></form>")
            .with_file("/logo.PNG", b"png")
            .with_file("/app.js", b"js")
    }

    fn get(uri: &str) -> Routed {
        route(&HttpRequest::from_uri(uri), &fs())
    }

    #[test]
    fn root_redirects_and_marks_activity() {
        let routed = get("/");
        assert_eq!(routed.response, HttpResponse::Redirect("/index.html"));
        assert_eq!(routed.commands, vec![WebCommand::Activity]);
    }

    #[test]
    fn setup_serves_generated_page_without_activity() {
        let routed = get("/setup");
        assert_eq!(
            routed.response,
            HttpResponse::Asset {
                content_type: "text/html",
                cache_control: None,
                body: b"<form></form>".to_vec(),
            }
        );
        assert!(routed.commands.is_empty());
    }

    #[test]
    fn every_captive_probe_returns_index() {
        for probe in CAPTIVE_PROBE_PATHS {
            let routed = get(probe);
            assert_eq!(routed.response.status(), 200, "{probe}");
            assert!(
                matches!(&routed.response, HttpResponse::Asset { body, .. } if body == b"<h1>index</h1>")
            );
            assert_eq!(routed.commands, vec![WebCommand::Activity]);
        }
    }

    #[test]
    fn save_decodes_parameters_and_defaults_missing_ones() {
        let routed = get("/save?hostname=den&ssid=Home+Net&ssid_pwd=p%40ss%3D1");
        assert_eq!(routed.response, HttpResponse::Redirect("/index.html"));
        assert_eq!(
            routed.commands,
            vec![WebCommand::Save {
                hostname: "den".to_string(),
                ssid: "Home Net".to_string(),
                ssid_pwd: "p@ss=1".to_string(),
            }]
        );

        let routed = get("/save?ssid=Home");
        assert_eq!(
            routed.commands,
            vec![WebCommand::Save {
                hostname: String::new(),
                ssid: "Home".to_string(),
                ssid_pwd: String::new(),
            }]
        );
    }

    #[test]
    fn config_routes_do_not_mark_activity() {
        assert_eq!(get("/reboot").commands, vec![WebCommand::Reboot]);
        assert_eq!(get("/load").commands, vec![WebCommand::Load]);
        assert_eq!(
            get("/wipe").commands,
            vec![WebCommand::Wipe { reboot: true }]
        );
        assert_eq!(
            get("/wipe?noreboot").commands,
            vec![WebCommand::Wipe { reboot: false }]
        );
    }

    #[test]
    fn static_assets_get_cache_policy_by_type() {
        let image = get("/logo.PNG");
        assert!(matches!(
            image.response,
            HttpResponse::Asset {
                content_type: "image/png",
                cache_control: Some("max-age=604800"),
                ..
            }
        ));

        let script = get("/app.js");
        assert!(matches!(
            script.response,
            HttpResponse::Asset {
                cache_control: Some("no-store"),
                ..
            }
        ));
        assert_eq!(script.commands, vec![WebCommand::Activity]);
    }

    #[test]
    fn unknown_path_is_plain_text_404_and_still_counts_as_activity() {
        let routed = get("/missing.css");
        assert_eq!(
            routed.response,
            HttpResponse::NotFound("/missing.css Not found!".to_string())
        );
        assert_eq!(routed.commands, vec![WebCommand::Activity]);
    }

    #[test]
    fn parent_segments_are_rejected() {
        assert_eq!(get("/../secret").response.status(), 404);
    }

    #[test]
    fn percent_decoding_keeps_bad_escapes() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz%41"), "%zzA");
    }
}
