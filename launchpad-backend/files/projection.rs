//! Maps a generated file set onto what a given backend needs to boot it.
//!
//! Projection is total: any input, including an empty or malformed one,
//! produces a file set with a manifest, an HTML entry and a module entry.

use std::path::{Component, Path};

use serde_json::{Value, json};

use super::{ProjectFile, dedupe};
use crate::sandbox::types::BackendKind;

const MODULE_ENTRIES: &[&str] = &[
    "src/main.jsx",
    "src/main.tsx",
    "src/main.js",
    "src/main.ts",
    "src/index.jsx",
    "src/index.tsx",
    "src/index.js",
    "src/index.ts",
];

const APP_MODULES: &[&str] = &["src/App.jsx", "src/App.tsx", "src/App.js", "src/App.ts"];

const VITE_CONFIGS: &[&str] = &[
    "vite.config.js",
    "vite.config.ts",
    "vite.config.mjs",
    "vite.config.mts",
];

/// Port the dev server listens on inside the IDE embed container.
pub const EMBED_DEV_PORT: u16 = 5173;

/// Produce a backend-ready file set. Never fails.
pub fn project(files: &[ProjectFile], kind: BackendKind) -> Vec<ProjectFile> {
    let normalized: Vec<ProjectFile> = files
        .iter()
        .filter_map(|f| {
            normalize_path(&f.path).map(|path| ProjectFile {
                path,
                content: f.content.clone(),
            })
        })
        .collect();
    let mut files = dedupe(normalized);

    ensure_manifest(&mut files);
    let entry = ensure_module_entry(&mut files);
    ensure_html_entry(&mut files, &entry);
    ensure_vite_config(&mut files, kind);

    if kind == BackendKind::IdeEmbed && find(&files, "sandbox.config.json").is_none() {
        files.push(ProjectFile::new(
            "sandbox.config.json",
            json_pretty(&json!({
                "template": "node",
                "container": { "port": EMBED_DEV_PORT, "startScript": "dev" }
            })),
        ));
    }

    files
}

/// Normalize a generated path to a clean, root-relative, forward-slash path.
/// Returns `None` for paths that collapse to nothing.
pub fn normalize_path(raw: &str) -> Option<String> {
    let unified = raw.trim().replace('\\', "/");
    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(seg) => parts.push(seg.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Minimal Vite + React project used under every generated file set.
pub fn scaffold(title: &str) -> Vec<ProjectFile> {
    vec![
        ProjectFile::new("package.json", scaffold_package_json(title)),
        ProjectFile::new("index.html", scaffold_index_html(title, "/src/main.jsx")),
        ProjectFile::new("vite.config.js", scaffold_vite_config(true, false)),
        ProjectFile::new("src/main.jsx", scaffold_main(Some("./App.jsx"))),
        ProjectFile::new("src/App.jsx", scaffold_app(title)),
        ProjectFile::new("src/index.css", SCAFFOLD_CSS),
    ]
}

pub fn package_name(title: &str) -> String {
    let mut name = String::with_capacity(title.len());
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            name.push(ch.to_ascii_lowercase());
        } else if !name.ends_with('-') {
            name.push('-');
        }
    }
    let name = name.trim_matches('-');
    if name.is_empty() {
        "generated-app".to_string()
    } else {
        name.chars().take(60).collect()
    }
}

pub fn html_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            '{' => out.push_str("&#123;"),
            '}' => out.push_str("&#125;"),
            _ => out.push(ch),
        }
    }
    out
}

fn scaffold_package_json(title: &str) -> String {
    json_pretty(&json!({
        "name": package_name(title),
        "private": true,
        "version": "0.0.0",
        "type": "module",
        "scripts": {
            "dev": "vite",
            "build": "vite build",
            "preview": "vite preview"
        },
        "dependencies": {
            "react": "^18.3.1",
            "react-dom": "^18.3.1"
        },
        "devDependencies": {
            "@vitejs/plugin-react": "^4.3.1",
            "vite": "^5.4.0"
        }
    }))
}

fn scaffold_index_html(title: &str, entry: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1.0" />
    <title>{}</title>
  </head>
  <body>
    <div id="root"></div>
    <script type="module" src="{entry}"></script>
  </body>
</html>
"#,
        html_escape(title)
    )
}

fn scaffold_main(app_import: Option<&str>) -> String {
    match app_import {
        Some(app) => format!(
            r#"import React from 'react';
import ReactDOM from 'react-dom/client';
import App from '{app}';

ReactDOM.createRoot(document.getElementById('root')).render(
  <React.StrictMode>
    <App />
  </React.StrictMode>
);
"#
        ),
        None => r#"import React from 'react';
import ReactDOM from 'react-dom/client';

ReactDOM.createRoot(document.getElementById('root')).render(
  <main style={{ fontFamily: 'system-ui', padding: '2rem' }}>
    <h1>Preview ready</h1>
  </main>
);
"#
        .to_string(),
    }
}

fn scaffold_app(title: &str) -> String {
    format!(
        r#"import './index.css';

export default function App() {{
  return (
    <main className="app">
      <h1>{}</h1>
    </main>
  );
}}
"#,
        html_escape(title)
    )
}

fn scaffold_vite_config(with_react: bool, public_host: bool) -> String {
    let server = if public_host {
        "server: { host: '0.0.0.0', allowedHosts: true }"
    } else {
        "server: { host: true }"
    };
    if with_react {
        format!(
            "import {{ defineConfig }} from 'vite';\nimport react from '@vitejs/plugin-react';\n\nexport default defineConfig({{\n  plugins: [react()],\n  {server},\n}});\n"
        )
    } else {
        format!("import {{ defineConfig }} from 'vite';\n\nexport default defineConfig({{\n  {server},\n}});\n")
    }
}

const SCAFFOLD_CSS: &str = r#":root {
  font-family: system-ui, -apple-system, 'Segoe UI', sans-serif;
  color: #1f2933;
  background: #f8fafc;
}

body {
  margin: 0;
}

.app {
  max-width: 960px;
  margin: 0 auto;
  padding: 3rem 1.5rem;
}
"#;

fn find<'a>(files: &'a [ProjectFile], path: &str) -> Option<&'a ProjectFile> {
    files.iter().find(|f| f.path == path)
}

fn json_pretty(value: &Value) -> String {
    let mut out = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    out.push('\n');
    out
}

fn ensure_manifest(files: &mut Vec<ProjectFile>) {
    let Some(pos) = files.iter().position(|f| f.path == "package.json") else {
        files.insert(
            0,
            ProjectFile::new("package.json", scaffold_package_json("generated-app")),
        );
        return;
    };

    // Unparseable manifests are passed through untouched.
    let Ok(Value::Object(mut manifest)) = serde_json::from_str::<Value>(&files[pos].content)
    else {
        return;
    };

    let has_dev = manifest
        .get("scripts")
        .and_then(|s| s.get("dev"))
        .is_some_and(|d| d.is_string());
    if has_dev {
        return;
    }

    let scripts = manifest
        .entry("scripts")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Value::Object(scripts) = scripts {
        scripts.insert("dev".into(), Value::String("vite".into()));
    }
    let dev_deps = manifest
        .entry("devDependencies")
        .or_insert_with(|| Value::Object(Default::default()));
    if let Value::Object(dev_deps) = dev_deps {
        dev_deps
            .entry("vite")
            .or_insert_with(|| Value::String("^5.4.0".into()));
    }
    files[pos].content = json_pretty(&Value::Object(manifest));
}

/// Make sure a JS/TS module entry exists and return its path.
fn ensure_module_entry(files: &mut Vec<ProjectFile>) -> String {
    if let Some(entry) = MODULE_ENTRIES.iter().find(|e| find(files, e).is_some()) {
        return entry.to_string();
    }
    let app = APP_MODULES
        .iter()
        .find(|a| find(files, a).is_some())
        .map(|a| format!("./{}", a.trim_start_matches("src/")));
    files.push(ProjectFile::new("src/main.jsx", scaffold_main(app.as_deref())));
    "src/main.jsx".to_string()
}

fn ensure_html_entry(files: &mut Vec<ProjectFile>, entry: &str) {
    if find(files, "index.html").is_some() {
        return;
    }
    files.push(ProjectFile::new(
        "index.html",
        scaffold_index_html("Preview", &format!("/{entry}")),
    ));
}

fn ensure_vite_config(files: &mut Vec<ProjectFile>, kind: BackendKind) {
    let public_host = kind != BackendKind::LocalContainer;
    if VITE_CONFIGS.iter().any(|c| find(files, c).is_some()) {
        return;
    }
    let with_react = find(files, "package.json")
        .is_some_and(|m| m.content.contains("@vitejs/plugin-react"));
    files.push(ProjectFile::new(
        "vite.config.js",
        scaffold_vite_config(with_react, public_host),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::has_entry_point;

    fn paths(files: &[ProjectFile]) -> Vec<&str> {
        files.iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn normalize_strips_prefixes_and_traversal() {
        assert_eq!(normalize_path("./src/App.jsx").as_deref(), Some("src/App.jsx"));
        assert_eq!(normalize_path("/index.html").as_deref(), Some("index.html"));
        assert_eq!(normalize_path("src\\main.jsx").as_deref(), Some("src/main.jsx"));
        assert_eq!(normalize_path("../../etc/passwd").as_deref(), Some("etc/passwd"));
        assert_eq!(normalize_path("src/../App.jsx").as_deref(), Some("App.jsx"));
        assert_eq!(normalize_path("  "), None);
        assert_eq!(normalize_path("./"), None);
    }

    #[test]
    fn empty_input_gets_full_scaffold() {
        let out = project(&[], BackendKind::LocalContainer);
        let p = paths(&out);
        assert!(p.contains(&"package.json"));
        assert!(p.contains(&"index.html"));
        assert!(p.contains(&"src/main.jsx"));
        assert!(p.contains(&"vite.config.js"));
        assert!(has_entry_point(&out));
    }

    #[test]
    fn existing_entries_are_preserved() {
        let input = vec![
            ProjectFile::new("index.html", "<custom/>"),
            ProjectFile::new("src/main.tsx", "custom main"),
            ProjectFile::new("package.json", r#"{"scripts":{"dev":"vite --open"}}"#),
            ProjectFile::new("vite.config.ts", "custom config"),
        ];
        let out = project(&input, BackendKind::RemoteSandbox);
        assert_eq!(out.len(), 4);
        assert_eq!(find(&out, "index.html").unwrap().content, "<custom/>");
        assert_eq!(find(&out, "src/main.tsx").unwrap().content, "custom main");
        assert_eq!(
            find(&out, "package.json").unwrap().content,
            r#"{"scripts":{"dev":"vite --open"}}"#
        );
    }

    #[test]
    fn html_entry_points_at_existing_module() {
        let input = vec![ProjectFile::new("src/index.tsx", "x")];
        let out = project(&input, BackendKind::LocalContainer);
        let html = &find(&out, "index.html").unwrap().content;
        assert!(html.contains(r#"src="/src/index.tsx""#));
        assert!(find(&out, "src/main.jsx").is_none());
    }

    #[test]
    fn synthesized_main_imports_app_when_present() {
        let input = vec![ProjectFile::new("src/App.tsx", "export default () => null")];
        let out = project(&input, BackendKind::LocalContainer);
        let main = &find(&out, "src/main.jsx").unwrap().content;
        assert!(main.contains("import App from './App.tsx'"));
    }

    #[test]
    fn manifest_without_dev_script_gets_one() {
        let input = vec![ProjectFile::new(
            "package.json",
            r#"{"name":"x","dependencies":{"react":"18"}}"#,
        )];
        let out = project(&input, BackendKind::LocalContainer);
        let manifest: Value =
            serde_json::from_str(&find(&out, "package.json").unwrap().content).unwrap();
        assert_eq!(manifest["scripts"]["dev"], "vite");
        assert_eq!(manifest["devDependencies"]["vite"], "^5.4.0");
        assert_eq!(manifest["dependencies"]["react"], "18");
    }

    #[test]
    fn malformed_manifest_passes_through() {
        let input = vec![ProjectFile::new("package.json", "{ not json")];
        let out = project(&input, BackendKind::LocalContainer);
        assert_eq!(find(&out, "package.json").unwrap().content, "{ not json");
    }

    #[test]
    fn remote_config_binds_public_host() {
        let out = project(&[], BackendKind::RemoteSandbox);
        let config = &find(&out, "vite.config.js").unwrap().content;
        assert!(config.contains("0.0.0.0"));
        assert!(config.contains("plugin-react"));
    }

    #[test]
    fn embed_gets_container_config() {
        let out = project(&[], BackendKind::IdeEmbed);
        let cfg: Value =
            serde_json::from_str(&find(&out, "sandbox.config.json").unwrap().content).unwrap();
        assert_eq!(cfg["template"], "node");
        assert_eq!(cfg["container"]["port"], 5173);

        let local = project(&[], BackendKind::LocalContainer);
        assert!(find(&local, "sandbox.config.json").is_none());
    }

    #[test]
    fn duplicate_paths_after_normalization_collapse() {
        let input = vec![
            ProjectFile::new("./src/App.jsx", "old"),
            ProjectFile::new("src/App.jsx", "new"),
        ];
        let out = project(&input, BackendKind::LocalContainer);
        let apps: Vec<_> = out.iter().filter(|f| f.path == "src/App.jsx").collect();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].content, "new");
    }

    #[test]
    fn scaffold_is_self_consistent() {
        let files = scaffold("My <Shop>");
        assert!(has_entry_point(&files));
        let manifest: Value =
            serde_json::from_str(&find(&files, "package.json").unwrap().content).unwrap();
        assert_eq!(manifest["name"], "my-shop");
        assert!(find(&files, "index.html").unwrap().content.contains("My &lt;Shop&gt;"));
    }

    #[test]
    fn package_name_falls_back_when_empty() {
        assert_eq!(package_name("!!!"), "generated-app");
        assert_eq!(package_name("Todo List 2"), "todo-list-2");
    }
}
