use core::fmt;
use std::str::FromStr;

/// Comparison operator of a segment constraint.
///
/// Documents spell operators the way people write them (`==`, `=~`,
/// `NOT IN`); the store keeps the internal code (`EQ`, `EREG`, `NOT IN`)
/// which is what the evaluation engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Ereg,
    Nereg,
    In,
    NotIn,
    Contains,
    NotContains,
}

impl Operator {
    pub const ALL: [Operator; 12] = [
        Operator::Eq,
        Operator::Neq,
        Operator::Lt,
        Operator::Lte,
        Operator::Gt,
        Operator::Gte,
        Operator::Ereg,
        Operator::Nereg,
        Operator::In,
        Operator::NotIn,
        Operator::Contains,
        Operator::NotContains,
    ];

    /// Translate a document token. Returns `None` for anything outside the
    /// vocabulary.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "==" => Some(Operator::Eq),
            "!=" => Some(Operator::Neq),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Lte),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Gte),
            "=~" => Some(Operator::Ereg),
            "!~" => Some(Operator::Nereg),
            "IN" => Some(Operator::In),
            "NOT IN" => Some(Operator::NotIn),
            "CONTAINS" => Some(Operator::Contains),
            "NOT CONTAINS" => Some(Operator::NotContains),
            _ => None,
        }
    }

    /// The document-facing token for this operator.
    pub fn token(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Neq => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Ereg => "=~",
            Operator::Nereg => "!~",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Contains => "CONTAINS",
            Operator::NotContains => "NOT CONTAINS",
        }
    }

    /// The persisted code for this operator.
    pub fn code(&self) -> &'static str {
        match self {
            Operator::Eq => "EQ",
            Operator::Neq => "NEQ",
            Operator::Lt => "LT",
            Operator::Lte => "LTE",
            Operator::Gt => "GT",
            Operator::Gte => "GTE",
            Operator::Ereg => "EREG",
            Operator::Nereg => "NEREG",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Contains => "CONTAINS",
            Operator::NotContains => "NOT CONTAINS",
        }
    }

    pub fn is_regex(&self) -> bool {
        matches!(self, Operator::Ereg | Operator::Nereg)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Parses a persisted operator code (not a document token).
impl FromStr for Operator {
    type Err = String;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        Operator::ALL
            .into_iter()
            .find(|op| op.code() == code)
            .ok_or_else(|| format!("unknown operator code: {}", code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_tokens_map_to_codes() {
        let table = [
            ("==", "EQ"),
            ("!=", "NEQ"),
            ("<", "LT"),
            ("<=", "LTE"),
            (">", "GT"),
            (">=", "GTE"),
            ("=~", "EREG"),
            ("!~", "NEREG"),
            ("IN", "IN"),
            ("NOT IN", "NOT IN"),
            ("CONTAINS", "CONTAINS"),
            ("NOT CONTAINS", "NOT CONTAINS"),
        ];
        for (token, code) in table {
            let op = Operator::from_token(token).unwrap();
            assert_eq!(op.code(), code, "token {}", token);
            assert_eq!(op.token(), token);
        }
    }

    #[test]
    fn test_unknown_tokens_rejected() {
        assert!(Operator::from_token("=").is_none());
        assert!(Operator::from_token("in").is_none());
        assert!(Operator::from_token("EQ").is_none());
        assert!(Operator::from_token("NOT  IN").is_none());
        assert!(Operator::from_token("").is_none());
    }

    #[test]
    fn test_code_parses_back() {
        for op in Operator::ALL {
            assert_eq!(op.code().parse::<Operator>().unwrap(), op);
        }
        assert!("==".parse::<Operator>().is_err());
    }

    #[test]
    fn test_regex_operators() {
        assert!(Operator::Ereg.is_regex());
        assert!(Operator::Nereg.is_regex());
        assert!(!Operator::In.is_regex());
    }
}
