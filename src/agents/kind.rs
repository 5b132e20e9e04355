//! The five analyzer families and what each one looks at.

use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AgentKind {
    Structure,
    Dependencies,
    DataFlow,
    RequestFlow,
    ApiSurface,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Structure,
        AgentKind::Dependencies,
        AgentKind::DataFlow,
        AgentKind::RequestFlow,
        AgentKind::ApiSurface,
    ];

    /// Stable name used in the change cache, config tables, and report files.
    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::Structure => "structure",
            AgentKind::Dependencies => "dependencies",
            AgentKind::DataFlow => "data_flow",
            AgentKind::RequestFlow => "request_flow",
            AgentKind::ApiSurface => "api_surface",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn title(&self) -> &'static str {
        match self {
            AgentKind::Structure => "Project Structure",
            AgentKind::Dependencies => "Dependencies",
            AgentKind::DataFlow => "Data Flow",
            AgentKind::RequestFlow => "Request Flow",
            AgentKind::ApiSurface => "API Surface",
        }
    }

    pub fn system_prompt(&self) -> String {
        let focus = match self {
            AgentKind::Structure => STRUCTURE_FOCUS,
            AgentKind::Dependencies => DEPENDENCIES_FOCUS,
            AgentKind::DataFlow => DATA_FLOW_FOCUS,
            AgentKind::RequestFlow => REQUEST_FLOW_FOCUS,
            AgentKind::ApiSurface => API_SURFACE_FOCUS,
        };
        format!("{}\n\n{}\n\n{}", ANALYST_PREAMBLE, focus, REPORT_RULES)
    }

    /// Whether the contents of `path` belong in this agent's prompt. Every
    /// agent still sees the full file listing.
    pub fn is_relevant(&self, path: &str) -> bool {
        let file_name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path);
        match self {
            AgentKind::Structure => {
                is_entry_point(file_name) || is_manifest(file_name) || is_readme(file_name)
            }
            AgentKind::Dependencies => is_manifest(file_name),
            AgentKind::DataFlow => matches(data_flow_re(), path),
            AgentKind::RequestFlow => matches(request_flow_re(), path),
            AgentKind::ApiSurface => is_entry_point(file_name) || matches(api_surface_re(), path),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const ANALYST_PREAMBLE: &str = r#"You are a senior engineer writing onboarding documentation for a codebase you have just been handed.
You receive the repository file listing and the contents of the files most relevant to your topic."#;

const STRUCTURE_FOCUS: &str = r#"TOPIC: project structure.
- Describe the top-level layout and what each major directory is for.
- Identify entry points and how the build is organized.
- Call out generated, vendored, or test-only areas."#;

const DEPENDENCIES_FOCUS: &str = r#"TOPIC: dependencies.
- List the direct dependencies per manifest and what each is used for.
- Flag duplicated, pinned, or unusually old dependencies.
- Note internal packages and how they depend on each other."#;

const DATA_FLOW_FOCUS: &str = r#"TOPIC: data flow.
- Describe the core data types and where they are created, transformed, and stored.
- Trace how data moves between persistence, domain logic, and presentation."#;

const REQUEST_FLOW_FOCUS: &str = r#"TOPIC: request flow.
- Trace an incoming request from the entry point through routing, middleware, and handlers.
- Note authentication, validation, and error handling along the way."#;

const API_SURFACE_FOCUS: &str = r#"TOPIC: API surface.
- Enumerate the public interfaces: exported modules, HTTP endpoints, RPC or schema definitions.
- Note stability signals such as versioning and deprecations."#;

const REPORT_RULES: &str = r#"RULES:
- Respond in Markdown with short sections and bullet lists.
- Cite file paths for every claim.
- Say so when the provided files are not enough to be sure."#;

const MANIFESTS: &[&str] = &[
    "Cargo.toml",
    "package.json",
    "go.mod",
    "pyproject.toml",
    "requirements.txt",
    "Pipfile",
    "setup.py",
    "Gemfile",
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "composer.json",
    "mix.exs",
    "Package.swift",
];

const ENTRY_POINTS: &[&str] = &[
    "main.rs", "lib.rs", "mod.rs", "main.go", "main.py", "__init__.py", "__main__.py",
    "index.ts", "index.js", "index.tsx", "app.py", "server.ts", "server.js",
];

fn is_manifest(file_name: &str) -> bool {
    MANIFESTS.contains(&file_name) || file_name.ends_with(".csproj")
}

fn is_entry_point(file_name: &str) -> bool {
    ENTRY_POINTS.contains(&file_name)
}

fn is_readme(file_name: &str) -> bool {
    file_name.to_ascii_lowercase().starts_with("readme")
}

fn matches(re: Option<&Regex>, path: &str) -> bool {
    re.map(|re| re.is_match(path)).unwrap_or(false)
}

fn data_flow_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(^|/)(models?|schemas?|entit(y|ies)|stores?|repos?|repositor(y|ies)|db|database|migrations?|dto|types)(/|\.|_|$)").ok()
    })
    .as_ref()
}

fn request_flow_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(^|/)(routes?|router|handlers?|controllers?|middlewares?|server|endpoints?|views?)(/|\.|_|$)").ok()
    })
    .as_ref()
}

fn api_surface_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)((^|/)api/|\.proto$|\.graphql$|(^|/)(openapi|swagger)[^/]*\.(ya?ml|json)$)").ok()
    })
    .as_ref()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for kind in AgentKind::ALL {
            assert_eq!(AgentKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(AgentKind::from_name("security"), None);
    }

    #[test]
    fn relevance_by_family() {
        assert!(AgentKind::Dependencies.is_relevant("Cargo.toml"));
        assert!(AgentKind::Dependencies.is_relevant("web/package.json"));
        assert!(!AgentKind::Dependencies.is_relevant("src/main.rs"));

        assert!(AgentKind::Structure.is_relevant("src/main.rs"));
        assert!(AgentKind::Structure.is_relevant("README.md"));

        assert!(AgentKind::RequestFlow.is_relevant("src/routes/users.ts"));
        assert!(AgentKind::RequestFlow.is_relevant("app/handler.go"));
        assert!(!AgentKind::RequestFlow.is_relevant("src/util.rs"));

        assert!(AgentKind::DataFlow.is_relevant("src/models/user.py"));
        assert!(AgentKind::DataFlow.is_relevant("db/migrations/001.sql"));

        assert!(AgentKind::ApiSurface.is_relevant("proto/service.proto"));
        assert!(AgentKind::ApiSurface.is_relevant("docs/openapi.yaml"));
        assert!(AgentKind::ApiSurface.is_relevant("src/api/v1.rs"));
    }

    #[test]
    fn prompts_differ_per_family() {
        let prompts: std::collections::BTreeSet<String> =
            AgentKind::ALL.iter().map(|k| k.system_prompt()).collect();
        assert_eq!(prompts.len(), AgentKind::ALL.len());
    }
}
