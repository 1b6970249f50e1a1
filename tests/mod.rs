//! Main test module for treearchive
//!
//! This module includes all test suites:
//! - Integration tests for complete backup jobs
//! - Chaos tests for failure containment
//! - Property-based tests for digest and blacklist invariants
//! - Edge cases around names, permissions and links
//! - Stress tests for wide trees and many entries

pub mod chaos;

#[cfg(test)]
mod edge_cases {
    use super::integration::{read_archive, BackupTestHarness};
    use ::treearchive::*;
    use std::fs;

    #[test]
    fn test_empty_directory() {
        let harness = BackupTestHarness::new();

        for (i, format) in ArchiveFormat::ALL.into_iter().enumerate() {
            let outcome = harness
                .run(BackupTestHarness::config(format), &format!("empty{}", i))
                .unwrap();
            assert_eq!(outcome.report.status.file_count, 0);
            assert_eq!(outcome.report.status.total_size, 0);

            let entries = read_archive(&outcome.report.archive, format);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].0, STATUS_FILENAME);
            assert!(verify_archive(&outcome.report.archive, format).unwrap().is_valid());
        }
    }

    #[test]
    fn test_special_filenames() {
        let harness = BackupTestHarness::new();
        let special_names = [
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file_with_underscores.txt",
            "file.multiple.dots.txt",
            ".hidden_file",
            "UPPERCASE.TXT",
            "file#hash.txt",
            "semi;colon.txt",
        ];
        for name in &special_names {
            harness.write(name, name.as_bytes());
        }

        for format in [ArchiveFormat::Zip, ArchiveFormat::Tar] {
            let outcome = harness
                .run(BackupTestHarness::config(format), &format!("special {}", format))
                .unwrap();
            let entries = read_archive(&outcome.report.archive, format);
            for name in &special_names {
                let (_, content) = entries.iter().find(|(n, _)| n == name).unwrap();
                assert_eq!(content, name.as_bytes());
            }
        }
    }

    #[test]
    fn test_unicode_filenames() {
        let harness = BackupTestHarness::new();
        let unicode_names = ["文件.txt", "файл.txt", "αρχείο.txt", "ファイル/データ.bin", "emoji_😀.txt"];
        for name in &unicode_names {
            harness.write(name, format!("content of {}", name).as_bytes());
        }

        for format in [ArchiveFormat::Zip, ArchiveFormat::Gzip] {
            let outcome = harness
                .run(BackupTestHarness::config(format), &format!("unicode {}", format))
                .unwrap();
            let mut names: Vec<_> = read_archive(&outcome.report.archive, format)
                .into_iter()
                .map(|(n, _)| n)
                .filter(|n| n != STATUS_FILENAME)
                .collect();
            names.sort();
            let mut expected: Vec<_> = unicode_names.iter().map(|n| n.to_string()).collect();
            expected.sort();
            assert_eq!(names, expected);
        }
    }

    #[test]
    fn test_long_paths_survive_tar_headers() {
        let harness = BackupTestHarness::new();
        let long_dir = "nested_directory_name/".repeat(8);
        let long_name = format!("{}{}.dat", long_dir, "x".repeat(120));
        harness.write(&long_name, b"deep");

        let outcome = harness
            .run(BackupTestHarness::config(ArchiveFormat::Tar), "long")
            .unwrap();
        let entries = read_archive(&outcome.report.archive, ArchiveFormat::Tar);
        assert!(entries.iter().any(|(n, c)| *n == long_name && c == b"deep"));
    }

    #[test]
    #[cfg(unix)]
    fn test_permission_preservation() {
        use std::os::unix::fs::PermissionsExt;

        let harness = BackupTestHarness::new();
        harness.write("script.sh", b"#!/bin/sh\necho hi\n");
        harness.write("readonly.txt", b"ro");
        let source = harness.source.path();
        fs::set_permissions(source.join("script.sh"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(source.join("readonly.txt"), fs::Permissions::from_mode(0o444)).unwrap();

        let outcome = harness
            .run(BackupTestHarness::config(ArchiveFormat::Tar), "perm tar")
            .unwrap();
        let mut archive = tar::Archive::new(fs::File::open(&outcome.report.archive).unwrap());
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mode = entry.header().mode().unwrap() & 0o777;
            match name.as_str() {
                "script.sh" => assert_eq!(mode, 0o755),
                "readonly.txt" => assert_eq!(mode, 0o444),
                _ => {}
            }
        }

        let outcome = harness
            .run(BackupTestHarness::config(ArchiveFormat::Zip), "perm zip")
            .unwrap();
        let mut archive = zip::ZipArchive::new(fs::File::open(&outcome.report.archive).unwrap()).unwrap();
        let script = archive.by_name("script.sh").unwrap();
        assert_eq!(script.unix_mode().unwrap() & 0o777, 0o755);
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_are_not_followed() {
        use std::os::unix::fs::symlink;

        let harness = BackupTestHarness::new();
        let outside = tempfile::TempDir::new().unwrap();
        fs::write(outside.path().join("secret.txt"), b"outside the tree").unwrap();

        harness.write("real.txt", b"real");
        let source = harness.source.path();
        symlink(outside.path().join("secret.txt"), source.join("link.txt")).unwrap();
        symlink(outside.path(), source.join("linked_dir")).unwrap();
        symlink(source.join("missing"), source.join("dangling")).unwrap();

        let outcome = harness
            .run(BackupTestHarness::config(ArchiveFormat::Zip), "links")
            .unwrap();
        let names = ArchiveReader::new(&outcome.report.archive, ArchiveFormat::Zip)
            .entry_names()
            .unwrap();
        assert_eq!(names, vec!["real.txt".to_string(), STATUS_FILENAME.to_string()]);
        assert!(outcome.report.status.is_complete());
    }

    #[test]
    fn test_root_status_file_is_replaced() {
        let harness = BackupTestHarness::new();
        harness.write(STATUS_FILENAME, b"{\"forged\": true}");
        harness.write("nested/.treearchive_status.json", b"not at the root");

        let outcome = harness
            .run(BackupTestHarness::config(ArchiveFormat::Gzip), "forged")
            .unwrap();
        let entries = read_archive(&outcome.report.archive, ArchiveFormat::Gzip);
        let trailers: Vec<_> = entries.iter().filter(|(n, _)| n == STATUS_FILENAME).collect();
        assert_eq!(trailers.len(), 1);
        assert!(CompressionStatus::from_bytes(&trailers[0].1).is_ok());
        assert_eq!(outcome.report.status.file_count, 1);
    }
}

#[cfg(test)]
mod stress_tests {
    use super::integration::{BackupTestHarness, FileGenerator};
    use ::treearchive::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_many_small_files_parallel() {
        let harness = BackupTestHarness::new();
        for i in 0..600 {
            harness.write(&format!("shard{}/f{}.txt", i % 17, i), format!("payload {}", i).as_bytes());
        }

        let mut config = BackupTestHarness::config(ArchiveFormat::Zip);
        config.compression_core_count_limit = 4;
        let outcome = BackupJob::new(harness.context(ActionInitiator::Console, Some("many")), config)
            .with_available_cores(4)
            .run()
            .unwrap();
        assert!(outcome.parallel || is_memory_backed_destination(&harness));
        assert_eq!(outcome.report.status.file_count, 600);

        let names = ArchiveReader::new(&outcome.report.archive, ArchiveFormat::Zip)
            .entry_names()
            .unwrap();
        assert_eq!(names.last().map(String::as_str), Some(STATUS_FILENAME));
        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }

    fn is_memory_backed_destination(harness: &BackupTestHarness) -> bool {
        utils::is_memory_backed(harness.backups.path())
    }

    #[test]
    fn test_concurrent_hashers_agree() {
        let mut generator = FileGenerator::new(99);
        let files: Vec<(String, Vec<u8>)> = (0..400)
            .map(|i| {
                let len = generator.below(512) as usize;
                (format!("dir/{}.bin", i), generator.noise(len))
            })
            .collect();

        let sequential = FileTreeHasher::new();
        for (path, data) in &files {
            sequential
                .update(path, &tree_hash::content_hash(data), data.len() as u64)
                .unwrap();
        }

        let shared = Arc::new(FileTreeHasher::new());
        let files = Arc::new(files);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let shared = Arc::clone(&shared);
                let files = Arc::clone(&files);
                thread::spawn(move || {
                    for (path, data) in files.iter().skip(t).step_by(8) {
                        shared
                            .update(path, &tree_hash::content_hash(data), data.len() as u64)
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(shared.finalize().unwrap(), sequential.finalize().unwrap());
    }
}
