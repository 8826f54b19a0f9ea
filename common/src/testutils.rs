use std::os::unix::fs::MetadataExt;
use std::path::Path;

pub fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    let tmp_dir = tempfile::tempdir()?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt -> ../bar/2.txt
    //    |- 6.txt -> (absolute path) .../foo/bar/3.txt
    let foo_path = tmp_dir.path().join("foo");
    std::fs::create_dir(&foo_path)?;
    std::fs::write(foo_path.join("0.txt"), "0")?;
    let bar_path = foo_path.join("bar");
    std::fs::create_dir(&bar_path)?;
    std::fs::write(bar_path.join("1.txt"), "1")?;
    std::fs::write(bar_path.join("2.txt"), "2")?;
    std::fs::write(bar_path.join("3.txt"), "3")?;
    let baz_path = foo_path.join("baz");
    std::fs::create_dir(&baz_path)?;
    std::fs::write(baz_path.join("4.txt"), "4")?;
    std::os::unix::fs::symlink("../bar/2.txt", baz_path.join("5.txt"))?;
    std::os::unix::fs::symlink(bar_path.join("3.txt"), baz_path.join("6.txt"))?;
    Ok(tmp_dir)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEqualityCheck {
    /// files must share inode and device
    HardLink,
    /// files must have the same content
    Content,
}

/// Compare two trees: same names and types, same symlink target strings and files equal
/// according to `check`.
pub fn check_dirs_identical(src: &Path, dst: &Path, check: FileEqualityCheck) -> anyhow::Result<()> {
    let mut src_names = vec![];
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let src_path = entry.path();
        let dst_path = dst.join(&name);
        let src_md = std::fs::symlink_metadata(&src_path)?;
        let dst_md = std::fs::symlink_metadata(&dst_path)
            .map_err(|err| anyhow::anyhow!("destination {:?} is missing: {}", &dst_path, err))?;
        assert_eq!(src_md.file_type().is_dir(), dst_md.file_type().is_dir());
        assert_eq!(src_md.file_type().is_symlink(), dst_md.file_type().is_symlink());
        if src_md.file_type().is_symlink() {
            assert_eq!(std::fs::read_link(&src_path)?, std::fs::read_link(&dst_path)?);
        } else if src_md.is_dir() {
            check_dirs_identical(&src_path, &dst_path, check)?;
        } else {
            match check {
                FileEqualityCheck::HardLink => {
                    assert_eq!(src_md.ino(), dst_md.ino(), "{:?} is not a hard link", &dst_path);
                    assert_eq!(src_md.dev(), dst_md.dev());
                }
                FileEqualityCheck::Content => {
                    assert_eq!(std::fs::read(&src_path)?, std::fs::read(&dst_path)?);
                }
            }
        }
        src_names.push(name);
    }
    let dst_count = std::fs::read_dir(dst)?.count();
    assert_eq!(src_names.len(), dst_count, "{:?} has extra entries", dst);
    Ok(())
}

/// Two temporary directories on different devices, if the test environment has them.
pub fn two_devices() -> Option<(tempfile::TempDir, tempfile::TempDir)> {
    let first = tempfile::tempdir().ok()?;
    let first_dev = std::fs::metadata(first.path()).ok()?.dev();
    for candidate in ["/dev/shm", "/var/tmp", "/run/user"] {
        let Ok(md) = std::fs::metadata(candidate) else {
            continue;
        };
        if md.dev() == first_dev {
            continue;
        }
        if let Ok(second) = tempfile::tempdir_in(candidate) {
            return Some((first, second));
        }
    }
    None
}
