use crate::download::USER_AGENT;
use crate::error::{PipelineError, PipelineResult};
use crate::metadata::{Category, ModMetadata};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use url::Url;

/// A downloadable file offered by the mod page. Transient: produced here,
/// consumed once by the download orchestrator, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFile {
    pub name: String,
    pub description: String,
    pub download_url: String,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub metadata: ModMetadata,
    pub image_url: Option<String>,
    pub files: Vec<CandidateFile>,
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static CELL: OnceLock<Regex> = OnceLock::new();
            regex(&CELL, $pattern)
        }
    };
}

static_regex!(
    mod_url_re,
    r"^https?://[^/]+/(mods|sounds|skins|guis|gamefiles)/(\d+)"
);
static_regex!(
    abs_archive_re,
    r#"(?i)https?://[^"'\s>]+\.(?:zip|rar|7z|pak)(?:\?[^"'\s>]*)?"#
);
static_regex!(
    rel_href_re,
    r#"(?i)href=["']([^"']+\.(?:zip|rar|7z|pak))(?:["']|\?)"#
);
static_regex!(script_re, r"(?is)<script[^>]*>(.*?)</script>");
static_regex!(
    keyed_url_re,
    r#"(?i)"(?:sDownloadUrl|downloadUrl|_sDownloadUrl|url)"\s*:\s*"([^"]+\.(?:zip|rar|7z|pak)(?:\?[^"]*)?)""#
);
static_regex!(
    proto_rel_re,
    r#"(?i)//[^"'\s>]+\.(?:zip|rar|7z|pak)(?:\?[^"'\s>]*)?"#
);
static_regex!(
    og_image_re,
    r#"(?i)<meta[^>]+property=["']og:image["'][^>]+content=["']([^"']+)["']"#
);
static_regex!(
    og_title_re,
    r#"(?i)<meta[^>]+property=["']og:title["'][^>]+content=["']([^"']+)["']"#
);
static_regex!(
    meta_desc_re,
    r#"(?i)<meta[^>]+name=["']description["'][^>]+content=["']([^"']+)["']"#
);

/// The fixed hosting-site path shape. Fails before any network traffic.
pub fn parse_mod_url(url: &str) -> PipelineResult<(String, String)> {
    let captures = mod_url_re()
        .captures(url)
        .ok_or_else(|| PipelineError::InvalidUrl(url.to_string()))?;
    Ok((captures[1].to_string(), captures[2].to_string()))
}

/// Resolves a mod page URL to metadata, an optional preview image URL, and
/// the list of downloadable files. Strategies run in fixed order, each one
/// only when its predecessor produced nothing usable; zero files after all
/// of them is `NoFilesFound`.
pub fn resolve(agent: &ureq::Agent, url: &str) -> PipelineResult<Resolution> {
    let (section, item_id) = parse_mod_url(url)?;

    let api_data = fetch_profile_page(agent, &item_id)
        .or_else(|| fetch_with_field_list(agent, &item_id))
        .or_else(|| fetch_legacy(agent, &section, &item_id));

    let mut resolution = Resolution {
        metadata: ModMetadata::named(format!("GB_{item_id}")),
        image_url: None,
        files: Vec::new(),
    };

    if let Some(data) = &api_data {
        apply_structured_fields(&mut resolution, data);
        resolution.files = files_from_structured(data);
    }

    if resolution.files.is_empty() {
        scrape_page(agent, url, &mut resolution, api_data.is_none());
    }

    if resolution.files.is_empty() {
        return Err(PipelineError::NoFilesFound {
            url: url.to_string(),
        });
    }

    for file in &mut resolution.files {
        file.download_url = normalize_candidate_url(url, &file.download_url);
    }
    if let Some(image) = resolution.image_url.take() {
        resolution.image_url = Some(normalize_candidate_url(url, &image));
    }
    Ok(resolution)
}

/// The richer endpoint the site itself uses for mod pages. A 200 body is
/// only usable when it carries files, a display name, or submitter info;
/// anything else (site-level error objects included) counts as no data.
fn fetch_profile_page(agent: &ureq::Agent, item_id: &str) -> Option<Value> {
    let endpoint = format!("https://gamebanana.com/apiv11/Mod/{item_id}/ProfilePage");
    let body = get_json(agent, &endpoint, &[])?;
    usable_profile(body)
}

fn fetch_with_field_list(agent: &ureq::Agent, item_id: &str) -> Option<Value> {
    let endpoint = format!("https://gamebanana.com/apiv11/Mod/{item_id}");
    let body = get_json(
        agent,
        &endpoint,
        &[("_csvFields", "name,previewMedia,files,submitter")],
    )?;
    usable_profile(body)
}

fn usable_profile(body: Value) -> Option<Value> {
    let object = body.as_object()?;
    let usable = ["_aFiles", "_sName", "_aSubmitter"]
        .iter()
        .any(|key| object.get(*key).map_or(false, |v| !v.is_null()));
    usable.then_some(body)
}

/// Legacy endpoints with progressively narrower field requests. The first
/// body without an explicit error marker wins.
fn fetch_legacy(agent: &ureq::Agent, section: &str, item_id: &str) -> Option<Value> {
    const ENDPOINTS: [&str; 2] = [
        "https://api.gamebanana.com/v11/Core/Item/Data",
        "https://api.gamebanana.com/Core/Item/Data",
    ];
    const FIELD_LISTS: [&str; 2] = ["name,description,RootCategory().name", "name,description"];

    let item_type = capitalize(section);
    for endpoint in ENDPOINTS {
        for fields in FIELD_LISTS {
            let params = [
                ("itemtype", item_type.as_str()),
                ("itemid", item_id),
                ("fields", fields),
            ];
            let Some(body) = get_json(agent, endpoint, &params) else {
                continue;
            };
            if body.get("error").is_some() {
                continue;
            }
            return Some(body);
        }
    }
    None
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Best-effort JSON GET. Network faults and non-2xx statuses both mean
/// "try the next strategy", never a hard error.
fn get_json(agent: &ureq::Agent, endpoint: &str, params: &[(&str, &str)]) -> Option<Value> {
    let mut request = agent.get(endpoint).set("User-Agent", USER_AGENT);
    for (key, value) in params {
        request = request.query(key, value);
    }
    match request.call() {
        Ok(response) => response.into_json::<Value>().ok(),
        Err(err) => {
            log::debug!("endpoint {endpoint} yielded no data: {err}");
            None
        }
    }
}

/// Field extraction with a fixed priority order per field. The long-form
/// text field beats the short description; markup is normalized to plain
/// text.
fn apply_structured_fields(resolution: &mut Resolution, data: &Value) {
    let meta = &mut resolution.metadata;
    if let Some(name) = string_field(data, "_sName") {
        meta.name = name;
    }
    if let Some(text) = string_field(data, "_sText") {
        let plain = html_to_text(&text);
        if !plain.is_empty() {
            meta.description = plain;
        }
    } else if let Some(desc) = string_field(data, "_sDescription") {
        meta.description = desc;
    }
    if let Some(author) = data
        .get("_aSubmitter")
        .and_then(|submitter| string_field(submitter, "_sName"))
    {
        meta.author = author;
    }
    if let Some(category) = data
        .get("_aCategory")
        .and_then(|cat| string_field(cat, "_sName"))
    {
        meta.category = map_category(&category);
    }
    resolution.image_url = preview_image_url(data);
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
}

fn map_category(name: &str) -> Category {
    let lower = name.to_ascii_lowercase();
    if lower.contains("skin") {
        Category::Skin
    } else if lower.contains("voice") || lower.contains("sound") {
        Category::Voice
    } else if lower.contains("ui") || lower.contains("interface") {
        Category::Ui
    } else if lower.contains("music") {
        Category::Music
    } else {
        Category::Other
    }
}

fn preview_image_url(data: &Value) -> Option<String> {
    let media = data.get("_aPreviewMedia")?;
    // the media list sometimes sits one level down
    let entries = media
        .as_array()
        .or_else(|| media.get("_aImages").and_then(Value::as_array))?;
    for entry in entries {
        let Some(object) = entry.as_object() else {
            continue;
        };
        // a base URL plus file name beats a bare URL field
        if let (Some(base), Some(file)) = (
            object.get("_sBaseUrl").and_then(Value::as_str),
            object.get("_sFile").and_then(Value::as_str),
        ) {
            return Some(format!("{}/{}", base.trim_end_matches('/'), file));
        }
        for key in ["_sBaseUrl", "_sUrl"] {
            if let Some(url) = object.get(key).and_then(Value::as_str) {
                return Some(url.to_string());
            }
        }
    }
    None
}

/// File list extraction: the known `_aFiles` schema first, then the
/// generic recursive search as the last resort against schema drift.
fn files_from_structured(data: &Value) -> Vec<CandidateFile> {
    if let Some(entries) = data.get("_aFiles").and_then(Value::as_array) {
        let files = candidates_from_entries(entries);
        if !files.is_empty() {
            return files;
        }
    }
    match find_file_array(data) {
        Some(entries) => candidates_from_entries(entries),
        None => Vec::new(),
    }
}

fn candidates_from_entries(entries: &[Value]) -> Vec<CandidateFile> {
    let mut files = Vec::new();
    for entry in entries {
        let Some(object) = entry.as_object() else {
            continue;
        };
        let download = pick_string(object, &["_sDownloadUrl", "sDownloadUrl", "downloadUrl"])
            .or_else(|| {
                object.iter().find_map(|(key, value)| {
                    let lower = key.to_ascii_lowercase();
                    (lower.contains("download") || lower == "url")
                        .then(|| value.as_str())
                        .flatten()
                        .map(|s| s.to_string())
                })
            });
        let Some(download) = download else {
            continue;
        };
        let name = pick_string(object, &["_sFile", "sFile", "_sName", "file", "name"])
            .unwrap_or_else(|| url_tail(&download));
        let description =
            pick_string(object, &["_sDescription", "description"]).unwrap_or_default();
        files.push(CandidateFile {
            name,
            description,
            download_url: download,
        });
    }
    files
}

fn pick_string(
    object: &serde_json::Map<String, Value>,
    keys: &[&str],
) -> Option<String> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Depth-first search over an arbitrary JSON document for an array of
/// objects that look file-like (each exposing a URL-shaped string field).
/// Keys mentioning files or downloads are preferred over positional finds.
/// Deliberately loose: the upstream schema drifts.
fn find_file_array(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if let Value::Array(items) = child {
                    let lower = key.to_ascii_lowercase();
                    if (lower.contains("file") || lower.contains("download"))
                        && items.iter().any(entry_is_file_like)
                    {
                        return Some(items);
                    }
                }
            }
            map.values().find_map(find_file_array)
        }
        Value::Array(items) => {
            if !items.is_empty() && items.iter().all(Value::is_object)
                && items.iter().any(entry_is_file_like)
            {
                return Some(items);
            }
            items.iter().find_map(find_file_array)
        }
        _ => None,
    }
}

fn entry_is_file_like(entry: &Value) -> bool {
    let Some(object) = entry.as_object() else {
        return false;
    };
    object.iter().any(|(key, value)| {
        let lower = key.to_ascii_lowercase();
        value.is_string()
            && (lower.contains("download") || lower.contains("url") || lower.contains("file"))
    })
}

/// HTML fallback: fetch the public page and pattern-match archive links
/// out of it. No script execution. Metadata from `og:` tags fills in only
/// when the structured API produced nothing at all.
fn scrape_page(agent: &ureq::Agent, url: &str, resolution: &mut Resolution, want_meta: bool) {
    let html = match agent.get(url).set("User-Agent", USER_AGENT).call() {
        Ok(response) => match response.into_string() {
            Ok(html) => html,
            Err(err) => {
                log::debug!("page body for {url} unreadable: {err}");
                return;
            }
        },
        Err(err) => {
            log::debug!("page fetch for {url} failed: {err}");
            return;
        }
    };

    if want_meta {
        if let Some(captures) = og_title_re().captures(&html) {
            resolution.metadata.name = captures[1].to_string();
        }
        if let Some(captures) = meta_desc_re().captures(&html) {
            resolution.metadata.description = captures[1].to_string();
        }
    }
    if resolution.image_url.is_none() {
        if let Some(captures) = og_image_re().captures(&html) {
            resolution.image_url = Some(captures[1].to_string());
        }
    }

    resolution.files = scrape_files(url, &html);
}

/// Last-resort preview lookup for installs whose resolution carried no
/// image: fetch the page and read its `og:image` tag.
pub fn scrape_page_image(agent: &ureq::Agent, url: &str) -> Option<String> {
    let html = agent
        .get(url)
        .set("User-Agent", USER_AGENT)
        .call()
        .ok()?
        .into_string()
        .ok()?;
    og_image_re()
        .captures(&html)
        .map(|captures| normalize_candidate_url(url, &captures[1]))
}

/// Archive links in page markup: absolute URLs, relative hrefs resolved
/// against the page, and URLs embedded in script bodies (direct, escaped
/// slashes, protocol-relative). Deduplicated by final URL.
pub fn scrape_files(page_url: &str, html: &str) -> Vec<CandidateFile> {
    let mut found: Vec<CandidateFile> = Vec::new();
    let mut push = |url: String| {
        if !found.iter().any(|file| file.download_url == url) {
            found.push(CandidateFile {
                name: url_tail(&url),
                description: String::new(),
                download_url: url,
            });
        }
    };

    for m in abs_archive_re().find_iter(html) {
        push(m.as_str().to_string());
    }

    for captures in rel_href_re().captures_iter(html) {
        let href = &captures[1];
        if href.starts_with("http") {
            push(href.to_string());
        } else if let Some(joined) = join_url(page_url, href) {
            push(joined);
        }
    }

    for script in script_re().captures_iter(html) {
        let body = script[1].replace("\\/", "/");
        for captures in keyed_url_re().captures_iter(&body) {
            let url = &captures[1];
            if url.starts_with("http") {
                push(url.to_string());
            } else if let Some(joined) = join_url(page_url, url) {
                push(joined);
            }
        }
        for m in abs_archive_re().find_iter(&body) {
            push(m.as_str().to_string());
        }
        for m in proto_rel_re().find_iter(&body) {
            let raw = m.as_str();
            if !raw.starts_with("http") {
                push(format!("https:{raw}"));
            }
        }
    }

    found
}

fn join_url(base: &str, relative: &str) -> Option<String> {
    Url::parse(base)
        .ok()?
        .join(relative)
        .ok()
        .map(|joined| joined.to_string())
}

fn url_tail(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or(url)
        .split('?')
        .next()
        .unwrap_or(url)
        .to_string()
}

/// Candidate URLs come back protocol-relative, root-relative, or
/// schemeless often enough that the orchestrator only ever receives
/// absolute URLs. Root-relative paths resolve against the page they were
/// scraped from.
pub fn normalize_candidate_url(page_url: &str, raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("//") {
        return format!("https://{rest}");
    }
    if trimmed.starts_with('/') {
        if let Some(joined) = join_url(page_url, trimmed) {
            return joined;
        }
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return format!("https://{trimmed}");
    }
    trimmed.to_string()
}

/// Basic markup to plaintext: line breaks, paragraph ends, and list items
/// become text; all remaining tags are stripped and blank runs collapsed.
pub fn html_to_text(raw: &str) -> String {
    static BR: OnceLock<Regex> = OnceLock::new();
    static P: OnceLock<Regex> = OnceLock::new();
    static LI: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();
    static BLANKS: OnceLock<Regex> = OnceLock::new();

    let text = regex(&BR, r"(?i)<br\s*/?>").replace_all(raw, "\n");
    let text = regex(&P, r"(?i)</p>").replace_all(&text, "\n");
    let text = regex(&LI, r"(?i)<li[^>]*>").replace_all(&text, "- ");
    let text = regex(&TAG, r"<[^>]+>").replace_all(&text, "");
    let text = regex(&BLANKS, r"\n\s*\n+").replace_all(&text, "\n\n");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recognizes_hosting_path_shapes() {
        let (section, id) = parse_mod_url("https://gamebanana.com/mods/12345").unwrap();
        assert_eq!(section, "mods");
        assert_eq!(id, "12345");

        let (section, _) = parse_mod_url("https://gamebanana.com/sounds/99?tab=files").unwrap();
        assert_eq!(section, "sounds");

        // the path shape is what matters, not the host
        assert!(parse_mod_url("https://example.com/mods/12345").is_ok());
    }

    #[test]
    fn rejects_unrecognized_paths_before_any_network_call() {
        for bad in [
            "https://gamebanana.com/members/1",
            "https://gamebanana.com/mods/",
            "not a url",
        ] {
            assert!(matches!(
                parse_mod_url(bad),
                Err(PipelineError::InvalidUrl(_))
            ));
        }
    }

    #[test]
    fn typed_files_shape_is_preferred() {
        let data = json!({
            "_sName": "Foo",
            "_aFiles": [
                {"_sFile": "foo.zip", "_sDownloadUrl": "https://cdn/foo.zip"}
            ]
        });
        let files = files_from_structured(&data);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "foo.zip");
        assert_eq!(files[0].download_url, "https://cdn/foo.zip");
    }

    #[test]
    fn generic_search_finds_drifted_schema() {
        let data = json!({
            "_aMod": {
                "nested": {
                    "_aAttachments": [
                        {"fileName": "bar.7z", "downloadUrl": "https://cdn/bar.7z"}
                    ]
                }
            }
        });
        let files = files_from_structured(&data);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].download_url, "https://cdn/bar.7z");
    }

    #[test]
    fn structured_fields_follow_priority_order() {
        let mut resolution = Resolution {
            metadata: ModMetadata::named("GB_1"),
            image_url: None,
            files: Vec::new(),
        };
        let data = json!({
            "_sName": "Cool Skin",
            "_sText": "<p>First line</p><br><ul><li>item one</li></ul>",
            "_sDescription": "short",
            "_aSubmitter": {"_sName": "Author"},
            "_aCategory": {"_sName": "Skins"},
            "_aPreviewMedia": {"_aImages": [
                {"_sBaseUrl": "https://img.example/base", "_sFile": "shot.jpg"}
            ]}
        });
        apply_structured_fields(&mut resolution, &data);
        assert_eq!(resolution.metadata.name, "Cool Skin");
        assert!(resolution.metadata.description.contains("First line"));
        assert!(resolution.metadata.description.contains("- item one"));
        assert_eq!(resolution.metadata.author, "Author");
        assert_eq!(resolution.metadata.category, Category::Skin);
        assert_eq!(
            resolution.image_url.as_deref(),
            Some("https://img.example/base/shot.jpg")
        );
    }

    #[test]
    fn scrape_resolves_relative_hrefs() {
        let html = r#"<a href="/dl/bar.pak">download</a>"#;
        let files = scrape_files("https://example.com/mods/1", html);
        assert_eq!(files.len(), 1);
        assert!(files[0].download_url.ends_with("/dl/bar.pak"));
        assert!(files[0].download_url.starts_with("https://example.com"));
        assert_eq!(files[0].name, "bar.pak");
    }

    #[test]
    fn scrape_finds_script_embedded_urls() {
        let html = concat!(
            r#"<script>var a = {"_sDownloadUrl":"https:\/\/cdn.example\/mod.zip"};"#,
            r#"var b = "//mirror.example/alt.rar";</script>"#
        );
        let files = scrape_files("https://example.com/mods/1", html);
        let urls: Vec<&str> = files.iter().map(|f| f.download_url.as_str()).collect();
        assert!(urls.contains(&"https://cdn.example/mod.zip"));
        assert!(urls.contains(&"https://mirror.example/alt.rar"));
    }

    #[test]
    fn scrape_deduplicates_by_final_url() {
        let html = concat!(
            r#"<a href="https://cdn.example/mod.zip">one</a>"#,
            r#"<script>var x = "https:\/\/cdn.example\/mod.zip";</script>"#
        );
        let files = scrape_files("https://example.com/mods/1", html);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn candidate_urls_normalize_to_absolute_https() {
        let page = "https://example.com/mods/1";
        assert_eq!(
            normalize_candidate_url(page, "//cdn.example/a.zip"),
            "https://cdn.example/a.zip"
        );
        assert_eq!(
            normalize_candidate_url(page, "cdn.example/a.zip"),
            "https://cdn.example/a.zip"
        );
        assert_eq!(
            normalize_candidate_url(page, " https://cdn.example/a.zip "),
            "https://cdn.example/a.zip"
        );
        assert_eq!(
            normalize_candidate_url(page, "http://cdn.example/a.zip"),
            "http://cdn.example/a.zip"
        );
    }

    #[test]
    fn root_relative_image_paths_resolve_against_the_page() {
        assert_eq!(
            normalize_candidate_url("https://example.com/mods/1", "/images/shot.jpg"),
            "https://example.com/images/shot.jpg"
        );
    }

    #[test]
    fn html_to_text_collapses_blank_runs() {
        let raw = "<p>one</p>\n\n\n<p>two</p><ul><li>alpha</li><li>beta</li></ul>";
        let text = html_to_text(raw);
        assert!(!text.contains("\n\n\n"));
        assert!(text.contains("one"));
        assert!(text.contains("- alpha"));
        assert!(text.contains("- beta"));
    }

    #[test]
    fn error_bodies_are_not_usable() {
        assert!(usable_profile(json!({"_sErrorCode": "NOT_FOUND"})).is_none());
        assert!(usable_profile(json!({"_sName": "Ok"})).is_some());
        assert!(usable_profile(json!([1, 2, 3])).is_none());
    }
}
