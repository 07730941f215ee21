use dbcap::masking::mask_connection_string;

#[test]
fn test_connection_string_password_masked() {
    let masked =
        mask_connection_string("Driver={HDBODBC};ServerNode=h:30015;UID=SYSTEM;PWD=Manager1;");
    assert_eq!(masked, "Driver={HDBODBC};ServerNode=h:30015;UID=SYSTEM;PWD=[REDACTED];");
}

#[test]
fn test_connection_string_braced_password_masked() {
    let masked = mask_connection_string("UID=sa;Password={a;b}}c};Encrypt=yes;");
    assert_eq!(masked, "UID=sa;Password=[REDACTED];Encrypt=yes;");
    assert!(!masked.contains("a;b"));
}

#[test]
fn test_connection_string_without_password_unchanged() {
    let conn = "Driver={Vertica};Servername=v;Port=5433;";
    assert_eq!(mask_connection_string(conn), conn);
}
