use diesel::prelude::*;

use crate::schema::installs;

/// A stored install row. `metadata` is an opaque JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Queryable, Selectable)]
#[diesel(table_name = installs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Install {
    pub id: i32,
    pub install_id: String,
    pub package_type: String,
    pub name: String,
    pub version: String,
    pub install_date: String,
    pub original_file: String,
    pub install_path: String,
    pub desktop_file: String,
    pub metadata: String,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = installs)]
pub struct NewInstall<'a> {
    pub install_id: &'a str,
    pub package_type: &'a str,
    pub name: &'a str,
    pub version: &'a str,
    pub install_date: &'a str,
    pub original_file: &'a str,
    pub install_path: &'a str,
    pub desktop_file: &'a str,
    pub metadata: &'a str,
}

/// Columns an update may touch. Identity columns are immutable.
#[derive(Debug, Default, AsChangeset)]
#[diesel(table_name = installs)]
pub struct InstallChanges<'a> {
    pub version: Option<&'a str>,
    pub desktop_file: Option<&'a str>,
    pub metadata: Option<&'a str>,
}
