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

use quick_error::quick_error;
use std::io;

quick_error! {
    #[derive(Debug)]
    pub enum Error {
        IO(err: io::Error) {
            from()
            display("I/O operation error: {}", err)
            source(err)
        }
        Corruption(msg: String) {
            display("data corruption: {}", msg)
        }
        NotFound(msg: Option<String>) {
            display("{}", msg.as_ref().map_or("key not found", |s| s.as_str()))
        }
        InvalidArgument(msg: String) {
            display("invalid argument: {}", msg)
        }
        DBClosed(msg: String) {
            display("db is closing or closed: {}", msg)
        }
        UnexpectedEOF {
            display("unexpected end of file")
        }
    }
}

impl Error {
    /// A structural copy of this error. `io::Error` is not `Clone`, so
    /// the copy keeps the kind and message but drops the source chain.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Error::IO(e) => Error::IO(io::Error::new(e.kind(), e.to_string())),
            Error::Corruption(msg) => Error::Corruption(msg.clone()),
            Error::NotFound(msg) => Error::NotFound(msg.clone()),
            Error::InvalidArgument(msg) => Error::InvalidArgument(msg.clone()),
            Error::DBClosed(msg) => Error::DBClosed(msg.clone()),
            Error::UnexpectedEOF => Error::UnexpectedEOF,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
