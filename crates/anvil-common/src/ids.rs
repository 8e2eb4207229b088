//! Id normalization for epics, stories and workers.
//!
//! Agents hand back identifiers in whatever shape they like ("Epic 1",
//! "epic-1", " EPIC_1 "). Every lookup and registration goes through the
//! functions here so that two spellings of the same id always land on the
//! same record. Fallbacks from a missing id to a title live only in
//! [`resolve_epic_id`] and [`resolve_story_id`].

/// Lowercase, trim, and collapse every run of non `[a-z0-9_]` characters into a
/// single `-`. Leading and trailing separators are dropped.
fn normalize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_dash = false;

    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    out
}

pub fn normalize_epic_id(raw: &str) -> String {
    normalize(raw)
}

pub fn normalize_story_id(raw: &str) -> String {
    normalize(raw)
}

pub fn normalize_worker_id(raw: &str) -> String {
    normalize(raw)
}

/// Key for a sandbox environment within a task ("acme/api" -> "acme-api").
pub fn normalize_repo_key(raw: &str) -> String {
    normalize(raw)
}

/// Resolve an epic id from an explicit id, falling back to its title.
/// Returns `None` when neither yields a non-empty id.
pub fn resolve_epic_id(id: Option<&str>, title: Option<&str>) -> Option<String> {
    resolve(id, title, normalize_epic_id)
}

/// Resolve a story id from an explicit id, falling back to its title.
pub fn resolve_story_id(id: Option<&str>, title: Option<&str>) -> Option<String> {
    resolve(id, title, normalize_story_id)
}

fn resolve(id: Option<&str>, title: Option<&str>, f: fn(&str) -> String) -> Option<String> {
    id.map(f)
        .filter(|s| !s.is_empty())
        .or_else(|| title.map(f).filter(|s| !s.is_empty()))
}

/// Derive the repository name from a repository reference such as
/// `git@github.com:acme/billing-api.git`, `https://host/acme/web` or `./services/api`.
pub fn repository_name(repo: &str) -> String {
    let trimmed = repo.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    normalize(last.trim_end_matches(".git"))
}
