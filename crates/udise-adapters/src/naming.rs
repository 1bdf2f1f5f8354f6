//! Output key naming for enrollment breakdowns.
//!
//! Each enrollment flag owns a group prefix. Flag 5 bundles several unrelated
//! groups, so its rows pick a prefix by sniffing the row name; anything that
//! matches no rule stays under the generic prefix.

use udise_core::EnrollmentFlag;

/// Prefix used for one flag's `*_Total` object and its rows by default.
pub fn group_prefix(flag: EnrollmentFlag) -> &'static str {
    match flag {
        EnrollmentFlag::Caste => "caste",
        EnrollmentFlag::Minority => "minority",
        EnrollmentFlag::Age => "age",
        EnrollmentFlag::Ews => "ews",
        EnrollmentFlag::Other => "other_grp",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Needle {
    /// Matches one `_`-separated token of the row slug exactly.
    Token(&'static str),
    /// Matches anywhere in the row slug.
    Substring(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct PrefixRule {
    pub needle: Needle,
    pub prefix: &'static str,
}

/// Row-name rules for flag 5, first match wins.
pub const OTHER_GROUP_RULES: &[PrefixRule] = &[
    PrefixRule { needle: Needle::Token("rte"), prefix: "rte" },
    PrefixRule { needle: Needle::Token("bpl"), prefix: "bpl" },
    PrefixRule { needle: Needle::Substring("aadha"), prefix: "aadhaar" },
    PrefixRule { needle: Needle::Substring("repeat"), prefix: "repeaters" },
    PrefixRule { needle: Needle::Token("cwsn"), prefix: "cwsn" },
];

impl Needle {
    fn matches(self, slug: &str) -> bool {
        match self {
            Needle::Token(token) => slug.split('_').any(|t| t == token),
            Needle::Substring(s) => slug.contains(s),
        }
    }
}

/// Prefix for one enrollment row of `flag`.
pub fn row_prefix(flag: EnrollmentFlag, row_slug: &str) -> &'static str {
    if flag != EnrollmentFlag::Other {
        return group_prefix(flag);
    }
    OTHER_GROUP_RULES
        .iter()
        .find(|rule| rule.needle.matches(row_slug))
        .map(|rule| rule.prefix)
        .unwrap_or_else(|| group_prefix(flag))
}

/// Identifier-safe slug of a row name; unnamed rows use their 1-based index.
///
/// Every whitespace run becomes one `_`, including leading and trailing runs,
/// so `" SC"` slugs to `_sc`.
pub fn row_slug(name: Option<&str>, index: usize) -> String {
    let mut slug = String::new();
    let mut in_space = false;
    for c in name.unwrap_or_default().to_lowercase().chars() {
        if c.is_whitespace() {
            if !in_space {
                slug.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            slug.push(c);
        }
    }
    if slug.is_empty() {
        (index + 1).to_string()
    } else {
        slug
    }
}

/// Namespace for a row's keys; a row named after its own prefix is not doubled.
pub fn row_namespace(prefix: &str, slug: &str) -> String {
    if prefix == slug {
        prefix.to_string()
    } else {
        format!("{prefix}_{slug}")
    }
}

pub fn namespaced_key(namespace: &str, key: &str) -> String {
    format!("{namespace}_{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_lowercases_collapses_whitespace_and_strips() {
        assert_eq!(row_slug(Some("General"), 0), "general");
        assert_eq!(row_slug(Some("Scheduled   Caste"), 0), "scheduled_caste");
        assert_eq!(row_slug(Some("O.B.C."), 0), "obc");
        assert_eq!(row_slug(Some("Age 5-6"), 0), "age_56");
    }

    #[test]
    fn untrimmed_names_keep_edge_underscores() {
        assert_eq!(row_slug(Some(" SC"), 0), "_sc");
        assert_eq!(row_slug(Some("\tST \n"), 0), "_st_");
        assert_eq!(
            row_namespace(row_prefix(EnrollmentFlag::Caste, "_sc"), "_sc"),
            "caste__sc"
        );
    }

    #[test]
    fn unnamed_rows_use_one_based_index() {
        assert_eq!(row_slug(None, 0), "1");
        assert_eq!(row_slug(Some(""), 2), "3");
        assert_eq!(row_slug(Some("--"), 4), "5");
    }

    #[test]
    fn fixed_flags_ignore_row_names() {
        assert_eq!(row_prefix(EnrollmentFlag::Caste, "bpl"), "caste");
        assert_eq!(row_prefix(EnrollmentFlag::Ews, "ews"), "ews");
    }

    #[test]
    fn other_flag_sniffs_row_names() {
        let flag = EnrollmentFlag::Other;
        assert_eq!(row_prefix(flag, "rte"), "rte");
        assert_eq!(row_prefix(flag, "bpl"), "bpl");
        assert_eq!(row_prefix(flag, "aadhar_seeded"), "aadhaar");
        assert_eq!(row_prefix(flag, "repeaters"), "repeaters");
        assert_eq!(row_prefix(flag, "cwsn"), "cwsn");
        assert_eq!(row_prefix(flag, "transgender"), "other_grp");
        assert_eq!(row_prefix(flag, "shortened"), "other_grp");
    }

    #[test]
    fn namespace_collapses_when_slug_equals_prefix() {
        let slug = row_slug(Some("BPL"), 0);
        let prefix = row_prefix(EnrollmentFlag::Other, &slug);
        let ns = row_namespace(prefix, &slug);
        assert_eq!(namespaced_key(&ns, "total"), "bpl_total");
        assert_eq!(
            namespaced_key(&row_namespace("caste", "sc"), "class_1_boy"),
            "caste_sc_class_1_boy"
        );
    }
}
