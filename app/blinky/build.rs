// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

fn main() {
    // beat-rt puts link.x on the search path; only the final binary needs
    // to be told to use it.
    if build_util::is_bare_metal() {
        println!("cargo:rustc-link-arg-bins=-Tlink.x");
    }
}
