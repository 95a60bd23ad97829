diesel::table! {
    installs (id) {
        id -> Integer,
        install_id -> Text,
        package_type -> Text,
        name -> Text,
        version -> Text,
        install_date -> Text,
        original_file -> Text,
        install_path -> Text,
        desktop_file -> Text,
        metadata -> Text,
    }
}
