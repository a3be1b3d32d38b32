use std::fmt;
use serde::{Serialize, Deserialize};

/// Record collections (tables) of the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Collection {
    Persons,
    Cases,
    CasePeople,
    CaseDocuments,
    Representations,
    Documents,
    Users,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Persons,
        Collection::Cases,
        Collection::CasePeople,
        Collection::CaseDocuments,
        Collection::Representations,
        Collection::Documents,
        Collection::Users,
    ];

    /// Collection targeted by a clause that names no alias.
    pub const DEFAULT_SEARCH: Collection = Collection::Persons;

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Persons => "Persons",
            Collection::Cases => "Cases",
            Collection::CasePeople => "CasePeople",
            Collection::CaseDocuments => "CaseDocuments",
            Collection::Representations => "Representations",
            Collection::Documents => "Documents",
            Collection::Users => "Users",
        }
    }

    /// Table names are matched case-insensitively, like SQL identifiers.
    pub fn from_name(name: &str) -> Option<Self> {
        Collection::ALL.iter().copied().find(|c| c.name().eq_ignore_ascii_case(name))
    }

    /// The fixed user-facing alias table.
    pub fn from_alias(alias: &str) -> Option<Self> {
        match alias {
            "user" => Some(Collection::Persons),
            "case" => Some(Collection::Cases),
            "docu" => Some(Collection::Documents),
            _ => None,
        }
    }

    pub fn is_alias(token: &str) -> bool {
        Collection::from_alias(token).is_some()
    }

    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Collection::Persons => &[
                "person_nb", "last_name", "first_name", "address", "birth_date",
                "contact_info", "gender", "description", "notes", "can_be_lawyer",
            ],
            Collection::Cases => &["case_nb", "case_description", "case_notes", "case_name"],
            Collection::CasePeople => &[
                "case_nb", "person_nb", "side", "has_external_lawyer", "self_represented",
            ],
            Collection::CaseDocuments => &["case_nb", "document_nb"],
            Collection::Representations => &["case_nb", "person_nb", "lawyer_nb", "side"],
            Collection::Documents => &[
                "document_nb", "document_path", "document_name",
                "document_description", "document_notes", "archived",
            ],
            Collection::Users => &["nb", "username", "password_hash", "role"],
        }
    }

    /// Fields searched when a clause carries no explicit `{field}`.
    pub fn default_fields(&self) -> &'static [&'static str] {
        match self {
            Collection::Persons => &["last_name", "first_name", "contact_info"],
            Collection::Cases => &["case_name"],
            Collection::Documents => &["document_name"],
            Collection::CasePeople | Collection::CaseDocuments | Collection::Representations => &["case_nb"],
            Collection::Users => &["username"],
        }
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns().contains(&column)
    }

    pub fn change_group(&self) -> Option<ChangeGroup> {
        ChangeGroup::ALL.iter().copied().find(|g| g.members().contains(self))
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Disjoint partitions of collections used to coalesce change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeGroup {
    Cases,
    People,
    Documents,
}

impl ChangeGroup {
    /// Detection order; markers are appended in this order.
    pub const ALL: [ChangeGroup; 3] = [ChangeGroup::Cases, ChangeGroup::People, ChangeGroup::Documents];

    pub fn marker(&self) -> u8 {
        match self {
            ChangeGroup::Cases => b'\t',
            ChangeGroup::People => b'\n',
            ChangeGroup::Documents => b' ',
        }
    }

    pub fn from_marker(byte: u8) -> Option<Self> {
        ChangeGroup::ALL.iter().copied().find(|g| g.marker() == byte)
    }

    pub fn members(&self) -> &'static [Collection] {
        match self {
            ChangeGroup::Cases => &[Collection::Cases, Collection::CasePeople, Collection::CaseDocuments],
            ChangeGroup::People => &[Collection::Persons],
            ChangeGroup::Documents => &[Collection::Documents],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl RowId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl From<u64> for RowId {
    fn from(id: u64) -> Self {
        RowId(id)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value bound to a `?` placeholder, or read back from a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(value: Vec<u8>) -> Self {
        SqlValue::Blob(value)
    }
}

pub type Row = Vec<SqlValue>;
