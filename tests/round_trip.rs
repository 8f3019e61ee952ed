use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use repack::archive::{RecordKind, NO_DATA};
use repack::{pack, read_header, unpack};
use tempfile::tempdir;
use walkdir::WalkDir;

fn write_zip(path: &Path, entries: &[(&str, Option<&[u8]>)]) -> Result<(), Box<dyn std::error::Error>> {
    let mut zip = zip::ZipWriter::new(fs::File::create(path)?);
    let options = zip::write::FileOptions::default();
    for (name, body) in entries {
        match body {
            Some(body) => {
                zip.start_file(*name, options)?;
                zip.write_all(body)?;
            }
            None => zip.add_directory(*name, options)?,
        }
    }
    zip.finish()?;
    Ok(())
}

/// File entry name to body. Directory entries are skipped since unpacking
/// writes one for every intermediate folder.
fn zip_contents(path: &Path) -> Result<BTreeMap<String, Vec<u8>>, Box<dyn std::error::Error>> {
    let mut zip = zip::ZipArchive::new(fs::File::open(path)?)?;
    let mut out = BTreeMap::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let mut body = Vec::new();
        entry.read_to_end(&mut body)?;
        out.insert(entry.name().to_string(), body);
    }
    Ok(out)
}

/// Relative path to file body; directories map to `None`. Zip files are compared by entries.
fn snapshot(root: &Path) -> Result<BTreeMap<String, Option<Vec<u8>>>, Box<dyn std::error::Error>> {
    let mut out = BTreeMap::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(root)?.to_string_lossy().replace('\\', "/");
        if entry.file_type().is_dir() {
            out.insert(rel, None);
        } else if rel.ends_with(".zip") || rel.ends_with(".jar") {
            for (name, body) in zip_contents(entry.path())? {
                out.insert(format!("{}!{}", rel, name), Some(body));
            }
        } else {
            out.insert(rel, Some(fs::read(entry.path())?));
        }
    }
    Ok(out)
}

#[test]
fn tree_with_containers_survives_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let work = tempdir()?;
    let src = work.path().join("src");
    fs::create_dir_all(src.join("docs/empty"))?;
    fs::create_dir_all(src.join("libs"))?;
    fs::write(src.join("zero.bin"), b"")?;
    fs::write(src.join("a.txt"), b"same bytes")?;
    fs::write(src.join("docs/b.txt"), b"same bytes")?;
    fs::write(src.join("docs/readme.md"), b"# readme\n")?;

    let mut inner = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut inner));
        zip.start_file("deep.txt", zip::write::FileOptions::default())?;
        zip.write_all(b"inside the nested zip")?;
        zip.finish()?;
    }
    write_zip(
        &src.join("libs/app.jar"),
        &[
            ("META-INF/", None),
            ("META-INF/MANIFEST.MF", Some(&b"Manifest-Version: 1.0\n"[..])),
            ("com/example/Main.class", Some(&b"same bytes"[..])),
            ("empty.txt", Some(&b""[..])),
            ("nested.zip", Some(&inner[..])),
        ],
    )?;

    let archive = work.path().join("out.rpk");
    pack(&src, &archive)?;

    let restored = work.path().join("restored");
    unpack(&archive, &restored)?;

    assert_eq!(snapshot(&src)?, snapshot(&restored)?);
    assert_eq!(fs::read(restored.join("zero.bin"))?.len(), 0);

    // The nested zip is stored as an ordinary blob, so it comes back byte for byte.
    let mut jar = zip::ZipArchive::new(fs::File::open(restored.join("libs/app.jar"))?)?;
    let mut nested = Vec::new();
    jar.by_name("nested.zip")?.read_to_end(&mut nested)?;
    assert_eq!(nested, inner);
    Ok(())
}

#[test]
fn identical_contents_share_one_blob() -> Result<(), Box<dyn std::error::Error>> {
    let work = tempdir()?;
    let src = work.path().join("src");
    fs::create_dir_all(src.join("x/y"))?;
    fs::write(src.join("one"), b"payload")?;
    fs::write(src.join("x/two"), b"payload")?;
    fs::write(src.join("x/y/three"), b"payload")?;
    fs::write(src.join("x/other"), b"different")?;
    fs::write(src.join("x/y/nothing"), b"")?;

    let archive = work.path().join("dedup.rpk");
    pack(&src, &archive)?;

    let header = read_header(&archive)?;
    assert_eq!(header.data.len(), 2);
    assert_eq!(header.total_payload_size as usize, "payload".len() + "different".len());

    let leaves: Vec<_> = header.folders.iter().filter(|r| r.kind == RecordKind::DataLeaf).collect();
    assert_eq!(leaves.len(), 5);
    let shared: Vec<_> = leaves.iter().filter(|r| r.name != "other" && r.name != "nothing").map(|r| r.data_ref).collect();
    assert!(shared.iter().all(|r| *r == shared[0]));
    assert!(leaves.iter().any(|r| r.name == "nothing" && r.data_ref == NO_DATA));

    let restored = work.path().join("restored");
    unpack(&archive, &restored)?;
    for rel in ["one", "x/two", "x/y/three"] {
        assert_eq!(fs::read(restored.join(rel))?, b"payload");
    }
    assert_eq!(fs::read(restored.join("x/other"))?, b"different");
    Ok(())
}

#[test]
fn empty_source_packs_to_a_root_only_archive() -> Result<(), Box<dyn std::error::Error>> {
    let work = tempdir()?;
    let src = work.path().join("src");
    fs::create_dir(&src)?;

    let archive = work.path().join("empty.rpk");
    pack(&src, &archive)?;
    let header = read_header(&archive)?;
    assert_eq!(header.folders.len(), 1);
    assert_eq!(header.folders[0].parent_id, 0);
    assert!(header.data.is_empty());
    assert_eq!(header.total_payload_size, 0);

    let restored = work.path().join("restored");
    unpack(&archive, &restored)?;
    assert!(restored.is_dir());
    assert_eq!(fs::read_dir(&restored)?.count(), 0);
    Ok(())
}

#[cfg(unix)]
#[test]
fn backslashes_in_names_are_not_separators() -> Result<(), Box<dyn std::error::Error>> {
    let work = tempdir()?;
    let src = work.path().join("src");
    fs::create_dir_all(src.join("x\\.."))?;
    fs::write(src.join("a\\b.txt"), b"hello")?;
    fs::write(src.join("x\\..").join("c\\"), b"world")?;

    let archive = work.path().join("names.rpk");
    pack(&src, &archive)?;

    let restored = work.path().join("restored");
    unpack(&archive, &restored)?;
    assert_eq!(snapshot(&src)?, snapshot(&restored)?);
    assert_eq!(fs::read(restored.join("a\\b.txt"))?, b"hello");
    assert!(!restored.join("a").exists());
    Ok(())
}

#[cfg(unix)]
#[test]
fn non_utf8_name_fails_the_pack() -> Result<(), Box<dyn std::error::Error>> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let work = tempdir()?;
    let src = work.path().join("src");
    fs::create_dir(&src)?;
    if fs::write(src.join(OsStr::from_bytes(b"caf\xe9.txt")), b"x").is_err() {
        return Ok(());
    }
    fs::write(src.join(OsStr::from_bytes(b"caf\xea.txt")), b"y")?;

    let archive = work.path().join("latin1.rpk");
    assert!(matches!(pack(&src, &archive), Err(repack::ArchiverError::InvalidArgument(_))));
    assert!(!archive.exists());
    Ok(())
}
