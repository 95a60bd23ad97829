//! Queries over the `installs` table.

use diesel::prelude::*;

use crate::{
    models::{Install, InstallChanges, NewInstall},
    schema::installs,
};

/// Repository for install record operations.
pub struct InstallRepository;

impl InstallRepository {
    /// Inserts a record and returns its row ID.
    pub fn insert(conn: &mut SqliteConnection, install: &NewInstall) -> QueryResult<i32> {
        diesel::insert_into(installs::table)
            .values(install)
            .returning(installs::id)
            .get_result(conn)
    }

    pub fn find_by_install_id(
        conn: &mut SqliteConnection,
        install_id: &str,
    ) -> QueryResult<Option<Install>> {
        installs::table
            .filter(installs::install_id.eq(install_id))
            .select(Install::as_select())
            .first(conn)
            .optional()
    }

    /// Finds records by package name, newest first.
    pub fn find_by_name(conn: &mut SqliteConnection, name: &str) -> QueryResult<Vec<Install>> {
        installs::table
            .filter(installs::name.eq(name))
            .order(installs::id.desc())
            .select(Install::as_select())
            .load(conn)
    }

    /// Lists all records in install order.
    pub fn list_all(conn: &mut SqliteConnection) -> QueryResult<Vec<Install>> {
        installs::table
            .order(installs::id.asc())
            .select(Install::as_select())
            .load(conn)
    }

    pub fn list_by_type(
        conn: &mut SqliteConnection,
        package_type: &str,
    ) -> QueryResult<Vec<Install>> {
        installs::table
            .filter(installs::package_type.eq(package_type))
            .order(installs::id.asc())
            .select(Install::as_select())
            .load(conn)
    }

    /// Applies `changes` and returns the number of rows touched.
    pub fn update(
        conn: &mut SqliteConnection,
        install_id: &str,
        changes: &InstallChanges,
    ) -> QueryResult<usize> {
        diesel::update(installs::table.filter(installs::install_id.eq(install_id)))
            .set(changes)
            .execute(conn)
    }

    pub fn delete_by_install_id(
        conn: &mut SqliteConnection,
        install_id: &str,
    ) -> QueryResult<usize> {
        diesel::delete(installs::table.filter(installs::install_id.eq(install_id))).execute(conn)
    }

    pub fn count(conn: &mut SqliteConnection) -> QueryResult<i64> {
        installs::table.count().get_result(conn)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::connection::DbConnection;

    fn setup() -> (TempDir, DbConnection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = DbConnection::open(dir.path().join("db/upkg.db")).unwrap();
        (dir, conn)
    }

    fn new_install<'a>(install_id: &'a str, name: &'a str, package_type: &'a str) -> NewInstall<'a> {
        NewInstall {
            install_id,
            package_type,
            name,
            version: "1.0.0",
            install_date: "2025-06-01T00:00:00Z",
            original_file: "/tmp/pkg",
            install_path: "/tmp/apps/pkg",
            desktop_file: "",
            metadata: r#"{"version":1}"#,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let (_dir, mut db) = setup();
        let id = InstallRepository::insert(db.conn(), &new_install("foo-1", "foo", "deb")).unwrap();
        assert!(id > 0);

        let found = InstallRepository::find_by_install_id(db.conn(), "foo-1")
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "foo");
        assert_eq!(found.package_type, "deb");
        assert!(InstallRepository::find_by_install_id(db.conn(), "missing")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_install_id_is_unique() {
        let (_dir, mut db) = setup();
        InstallRepository::insert(db.conn(), &new_install("foo-1", "foo", "deb")).unwrap();
        let err = InstallRepository::insert(db.conn(), &new_install("foo-1", "foo", "rpm"));
        assert!(err.is_err());
    }

    #[test]
    fn test_list_and_filter() {
        let (_dir, mut db) = setup();
        InstallRepository::insert(db.conn(), &new_install("a-1", "a", "deb")).unwrap();
        InstallRepository::insert(db.conn(), &new_install("b-1", "b", "appimage")).unwrap();
        InstallRepository::insert(db.conn(), &new_install("a-2", "a", "deb")).unwrap();

        assert_eq!(InstallRepository::count(db.conn()).unwrap(), 3);
        assert_eq!(InstallRepository::list_by_type(db.conn(), "deb").unwrap().len(), 2);

        let by_name = InstallRepository::find_by_name(db.conn(), "a").unwrap();
        assert_eq!(by_name[0].install_id, "a-2");
    }

    #[test]
    fn test_update_and_delete() {
        let (_dir, mut db) = setup();
        InstallRepository::insert(db.conn(), &new_install("foo-1", "foo", "tarball")).unwrap();

        let changes = InstallChanges {
            desktop_file: Some("/apps/foo.desktop"),
            ..Default::default()
        };
        assert_eq!(InstallRepository::update(db.conn(), "foo-1", &changes).unwrap(), 1);
        let found = InstallRepository::find_by_install_id(db.conn(), "foo-1")
            .unwrap()
            .unwrap();
        assert_eq!(found.desktop_file, "/apps/foo.desktop");
        assert_eq!(found.version, "1.0.0");

        assert_eq!(InstallRepository::delete_by_install_id(db.conn(), "foo-1").unwrap(), 1);
        assert_eq!(InstallRepository::delete_by_install_id(db.conn(), "foo-1").unwrap(), 0);
    }

    #[test]
    fn test_read_only_connection_rejects_writes() {
        let (dir, mut db) = setup();
        InstallRepository::insert(db.conn(), &new_install("foo-1", "foo", "deb")).unwrap();

        let mut reader = DbConnection::open_read_only(dir.path().join("db/upkg.db")).unwrap();
        assert_eq!(InstallRepository::count(reader.conn()).unwrap(), 1);
        assert!(InstallRepository::insert(reader.conn(), &new_install("bar-1", "bar", "deb")).is_err());
    }
}
