use std::fs;
use std::path::{Path, PathBuf};

fn rs_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|s| s.to_str()) == Some("rs") {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

fn rel(path: &Path) -> String {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"));
    let rel = path
        .strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string();
    rel.replace('\\', "/")
}

fn violations_outside_platform(needle: &str) -> Vec<String> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    let mut violations = Vec::new();
    for file in rs_files(&root) {
        let content = fs::read_to_string(&file).unwrap_or_default();
        let rel_path = rel(&file);
        if content.contains(needle) && !rel_path.starts_with("src/system/platform/") {
            violations.push(format!("{rel_path} contains `{needle}`"));
        }
    }
    violations
}

#[test]
fn target_os_cfg_is_scoped_to_system_platform() {
    let violations = violations_outside_platform("target_os");
    assert!(
        violations.is_empty(),
        "Unexpected target_os cfg usage:\n{}",
        violations.join("\n")
    );
}

#[test]
fn unsafe_code_is_scoped_to_system_platform() {
    let violations = violations_outside_platform("unsafe");
    assert!(
        violations.is_empty(),
        "Unexpected unsafe usage:\n{}",
        violations.join("\n")
    );
}

#[test]
fn parser_and_tree_do_not_reach_platform_backends() {
    let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("src/system");
    let mut violations = Vec::new();
    for name in ["layout.rs", "parser.rs", "process.rs", "delta.rs", "buffer.rs"] {
        let file = root.join(name);
        let content = fs::read_to_string(&file).unwrap_or_default();
        for forbidden in ["platform::", "windows_sys", "libc::", "sysinfo::"] {
            if content.contains(forbidden) {
                violations.push(format!("{} imports `{forbidden}`", rel(&file)));
            }
        }
    }
    assert!(
        violations.is_empty(),
        "Core layering violations:\n{}",
        violations.join("\n")
    );
}
