// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities shared by the mesh coordinator's test suites.

pub mod certificates;
pub mod dev;
pub mod manifest;
pub mod recovery;
