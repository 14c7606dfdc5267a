//! Script root containment and allow-listing.

mod test_harness;

use std::fs;
use std::os::unix::fs::symlink;

use test_harness::{read_response, request, TestGateway};

#[test]
fn test_traversal_never_leaves_script_root() {
    let gateway = TestGateway::start();
    // A script one level above the root that a naive resolver would run.
    fs::write(gateway.scratch("secret.sh"), "printf leaked\n").expect("write secret");

    for path in [
        "/../secret",
        "/%2e%2e/secret",
        "/%2E%2E%2Fsecret",
        "/a/../../secret",
        "/../../etc/passwd",
        "/..%2f..%2fetc%2fpasswd",
    ] {
        let res = gateway.post(path, None);
        assert!(
            res.status == 403 || res.status == 404,
            "{} answered {}",
            path,
            res.status
        );
        assert!(!res.text().contains("leaked"));
        assert!(!res.text().contains("root:"));
    }
}

#[test]
fn test_traversal_with_empty_extension() {
    let gateway = TestGateway::start_with(&[("extension", "\"\"")]);

    let mut stream = gateway.send(&request("POST", "/../../../../etc/passwd", "HTTP/1.1", None));
    let res = read_response(&mut stream);

    assert_eq!(res.status, 403);
}

#[test]
fn test_symlink_out_of_root_is_forbidden() {
    let gateway = TestGateway::start();
    let outside = gateway.scratch("outside.sh");
    fs::write(&outside, "printf leaked\n").expect("write outside");
    symlink(&outside, gateway.root.join("link.sh")).expect("symlink");

    let res = gateway.post("/link", None);

    assert_eq!(res.status, 403);
    assert!(!res.text().contains("leaked"));
}

#[test]
fn test_symlink_inside_root_is_followed() {
    let gateway = TestGateway::start();
    let real = gateway.script("real", "printf real\n");
    symlink(&real, gateway.root.join("alias.sh")).expect("symlink");

    let res = gateway.post("/alias", None);

    assert_eq!(res.status, 200);
    assert_eq!(res.text(), "real");
}

#[test]
fn test_allow_list() {
    let gateway = TestGateway::start_with(&[("scripts", "[public, tools/ok]")]);
    gateway.script("public", "printf public\n");
    gateway.script("private", "printf private\n");
    gateway.script("tools/ok", "printf ok\n");

    assert_eq!(gateway.post("/public", None).text(), "public");
    assert_eq!(gateway.post("/tools/ok", None).text(), "ok");
    assert_eq!(gateway.post("/private", None).status, 404);
}
