use regex::Regex;

/// Always excluded, on top of a search's own `-term`s.
pub const DEFAULT_IMPLICIT_EXCLUSION: &str = "defekt";

#[derive(Debug, Clone)]
struct IncludeTerm {
    term: String,
    pattern: Option<Regex>,
}

impl IncludeTerm {
    fn new(term: &str) -> Self {
        // numeric model numbers may be glued to other characters ("rtx3080ti")
        let pattern = if term.chars().all(|c| c.is_ascii_digit()) {
            None
        } else {
            let escaped = regex::escape(term);
            Regex::new(&format!(r"\b{escaped}\b|\d{escaped}\b")).ok()
        };
        Self {
            term: term.to_string(),
            pattern,
        }
    }

    fn is_match(&self, title_lower: &str) -> bool {
        match &self.pattern {
            Some(re) => re.is_match(title_lower),
            None => title_lower.contains(&self.term),
        }
    }
}

/// A search string split into include and exclude terms, lower-cased.
#[derive(Debug, Clone)]
pub struct SearchTerms {
    include: Vec<IncludeTerm>,
    exclude: Vec<String>,
}

impl SearchTerms {
    pub fn parse(search_string: &str, implicit_exclusions: &[String]) -> Self {
        let mut include = Vec::new();
        let mut exclude = Vec::new();

        for term in search_string.split(' ').map(str::trim).filter(|t| !t.is_empty()) {
            let term = term.to_lowercase();
            match term.strip_prefix('-') {
                Some(excluded) if !excluded.is_empty() => exclude.push(excluded.to_string()),
                Some(_) => {}
                None => include.push(IncludeTerm::new(&term)),
            }
        }
        exclude.extend(
            implicit_exclusions
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty()),
        );

        Self { include, exclude }
    }

    pub fn include_terms(&self) -> impl Iterator<Item = &str> {
        self.include.iter().map(|t| t.term.as_str())
    }

    /// First exclusion term found in the title, if any.
    pub fn excluded_by(&self, title: &str) -> Option<&str> {
        let title_lower = title.to_lowercase();
        self.exclude
            .iter()
            .find(|term| title_lower.contains(term.as_str()))
            .map(String::as_str)
    }

    pub fn includes_all(&self, title: &str) -> bool {
        let title_lower = title.to_lowercase();
        self.include.iter().all(|term| term.is_match(&title_lower))
    }

    pub fn matches(&self, title: &str) -> bool {
        self.includes_all(title) && self.excluded_by(title).is_none()
    }
}

/// Title matching with a configurable set of application-wide exclusions.
#[derive(Debug, Clone)]
pub struct TitleMatcher {
    implicit_exclusions: Vec<String>,
}

impl Default for TitleMatcher {
    fn default() -> Self {
        Self {
            implicit_exclusions: vec![DEFAULT_IMPLICIT_EXCLUSION.to_string()],
        }
    }
}

impl TitleMatcher {
    pub fn new(implicit_exclusions: Vec<String>) -> Self {
        Self { implicit_exclusions }
    }

    pub fn terms(&self, search_string: &str) -> SearchTerms {
        SearchTerms::parse(search_string, &self.implicit_exclusions)
    }
}
