//! Executors, `prepare` (lock-intent) functions, and undo-log builders
//! for the representative command subset SPEC_FULL.md §6 names, grouped
//! the way `original_source/redis/commands.go` groups its registrations
//! by data type. [`register_all`] is the crate's single init-time
//! registration point (§9 "Command registration as process-wide
//! state").

pub mod admin;
mod hashes;
mod keys;
mod lists;
mod sets;
mod sorted_sets;
mod strings;
mod util;

use std::collections::HashMap;

use crate::registry::CommandSpec;

pub fn register_all(table: &mut HashMap<String, CommandSpec>) {
    keys::register(table);
    strings::register(table);
    lists::register(table);
    hashes::register(table);
    sets::register(table);
    sorted_sets::register(table);
}
