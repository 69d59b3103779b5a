// Copyright 2024 The silt Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

// Copyright (c) 2011 The LevelDB Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::storage::{do_write_string_to_file, Storage};
use crate::Result;
use std::path::{Path, PathBuf, MAIN_SEPARATOR};

/// The kinds of files living in a db directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// `*.log` write-ahead log files
    Log,
    /// `LOCK` guarding the db directory against concurrent opens
    Lock,
    /// `*.sst` table files
    Table,
    /// `MANIFEST-*` version-edit logs
    Manifest,
    /// `CURRENT` pointing at the live manifest
    Current,
    /// `*.dbtmp` scratch files, renamed into place when complete
    Temp,
    /// `LOG` / `LOG.old` info logs
    InfoLog,
    OldInfoLog,
}

/// Builds the path of the file with given `file_type` and number.
pub fn generate_filename<P: AsRef<Path>>(db_path: P, file_type: FileType, seq: u64) -> PathBuf {
    let db_path = db_path.as_ref();
    let name = match file_type {
        FileType::Log => format!("{:06}.log", seq),
        FileType::Lock => "LOCK".to_owned(),
        FileType::Table => format!("{:06}.sst", seq),
        FileType::Manifest => format!("MANIFEST-{:06}", seq),
        FileType::Current => "CURRENT".to_owned(),
        FileType::Temp => format!("{:06}.dbtmp", seq),
        FileType::InfoLog => "LOG".to_owned(),
        FileType::OldInfoLog => "LOG.old".to_owned(),
    };
    db_path.join(name)
}

/// Parses a path into its file type and number. Returns `None` for
/// names this db never generates.
pub fn parse_filename<P: AsRef<Path>>(path: P) -> Option<(FileType, u64)> {
    let path = path.as_ref();
    let name = path.file_name()?.to_str()?;
    match name {
        "CURRENT" => Some((FileType::Current, 0)),
        "LOCK" => Some((FileType::Lock, 0)),
        "LOG" => Some((FileType::InfoLog, 0)),
        "LOG.old" => Some((FileType::OldInfoLog, 0)),
        _ => {
            if let Some(rest) = name.strip_prefix("MANIFEST-") {
                rest.parse::<u64>()
                    .ok()
                    .map(|num| (FileType::Manifest, num))
            } else if let Some((num, ext)) = name.split_once('.') {
                match num.parse::<u64>() {
                    Ok(num) => match ext {
                        "log" => Some((FileType::Log, num)),
                        "sst" => Some((FileType::Table, num)),
                        "dbtmp" => Some((FileType::Temp, num)),
                        _ => None,
                    },
                    Err(_) => None,
                }
            } else {
                None
            }
        }
    }
}

/// Points `CURRENT` at the manifest with the given number, going
/// through a synced temp file so a crash never leaves a torn CURRENT.
pub fn update_current<S: Storage>(env: &S, db_path: &str, manifest_file_number: u64) -> Result<()> {
    // Remove leading "db_path/" since the CURRENT content is relative
    // to the db directory.
    let manifest = generate_filename(db_path, FileType::Manifest, manifest_file_number);
    let mut contents = manifest.to_string_lossy().into_owned();
    let prefix = format!("{}{}", db_path, MAIN_SEPARATOR);
    if let Some(rest) = contents.strip_prefix(&prefix) {
        contents = rest.to_owned();
    }
    contents.push('\n');
    let tmp = generate_filename(db_path, FileType::Temp, manifest_file_number);
    let result = do_write_string_to_file(env, &contents, &tmp, true);
    match &result {
        Ok(()) => env.rename(&tmp, &generate_filename(db_path, FileType::Current, 0))?,
        Err(_) => {
            let _ = env.remove(&tmp);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_filename() {
        let tests: Vec<(FileType, u64, &str)> = vec![
            (FileType::Log, 7, "db/000007.log"),
            (FileType::Table, 123, "db/000123.sst"),
            (FileType::Manifest, 9, "db/MANIFEST-000009"),
            (FileType::Current, 0, "db/CURRENT"),
            (FileType::Lock, 0, "db/LOCK"),
            (FileType::Temp, 4, "db/000004.dbtmp"),
            (FileType::InfoLog, 0, "db/LOG"),
            (FileType::OldInfoLog, 0, "db/LOG.old"),
        ];
        for (t, num, expect) in tests {
            assert_eq!(
                generate_filename("db", t, num),
                PathBuf::from(expect.replace('/', &MAIN_SEPARATOR.to_string()))
            );
        }
    }

    #[test]
    fn test_parse_filename() {
        let tests: Vec<(&str, Option<(FileType, u64)>)> = vec![
            ("db/000007.log", Some((FileType::Log, 7))),
            ("db/000123.sst", Some((FileType::Table, 123))),
            ("db/MANIFEST-000009", Some((FileType::Manifest, 9))),
            ("db/CURRENT", Some((FileType::Current, 0))),
            ("db/LOCK", Some((FileType::Lock, 0))),
            ("db/LOG", Some((FileType::InfoLog, 0))),
            ("db/LOG.old", Some((FileType::OldInfoLog, 0))),
            ("db/000004.dbtmp", Some((FileType::Temp, 4))),
            ("db/MANIFEST-abc", None),
            ("db/abc.log", None),
            ("db/000007.unknown", None),
            ("db/readme", None),
        ];
        for (input, expect) in tests {
            assert_eq!(parse_filename(input), expect, "{}", input);
        }
    }

    #[test]
    fn test_update_current() {
        use crate::storage::mem::MemStorage;
        use crate::storage::File;
        let env = MemStorage::default();
        env.mkdir_all("db").unwrap();
        update_current(&env, "db", 3).unwrap();
        let mut contents = vec![];
        env.open("db/CURRENT")
            .unwrap()
            .read_all(&mut contents)
            .unwrap();
        assert_eq!(contents, b"MANIFEST-000003\n");
        assert!(!env.exists("db/000003.dbtmp"));
        // replacing an existing CURRENT
        update_current(&env, "db", 8).unwrap();
        let mut contents = vec![];
        env.open("db/CURRENT")
            .unwrap()
            .read_all(&mut contents)
            .unwrap();
        assert_eq!(contents, b"MANIFEST-000008\n");
    }
}
