// Copyright 2021 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The fixed emoji table of the SAS emoji method.
//!
//! The table is defined by the [spec], every client needs to map the same
//! index to the same emoji, otherwise two users comparing their screens will
//! never see a match.
//!
//! [spec]: https://spec.matrix.org/unstable/client-server-api/#sas-method-emoji

use itertools::Itertools;

use super::Emoji;

/// The number of entries in the SAS emoji table.
pub const EMOJI_TABLE_SIZE: usize = 64;

const EMOJI_TABLE: [Emoji; EMOJI_TABLE_SIZE] = [
    Emoji { symbol: "🐶", description: "Dog" },
    Emoji { symbol: "🐱", description: "Cat" },
    Emoji { symbol: "🦁", description: "Lion" },
    Emoji { symbol: "🐎", description: "Horse" },
    Emoji { symbol: "🦄", description: "Unicorn" },
    Emoji { symbol: "🐷", description: "Pig" },
    Emoji { symbol: "🐘", description: "Elephant" },
    Emoji { symbol: "🐰", description: "Rabbit" },
    Emoji { symbol: "🐼", description: "Panda" },
    Emoji { symbol: "🐓", description: "Rooster" },
    Emoji { symbol: "🐧", description: "Penguin" },
    Emoji { symbol: "🐢", description: "Turtle" },
    Emoji { symbol: "🐟", description: "Fish" },
    Emoji { symbol: "🐙", description: "Octopus" },
    Emoji { symbol: "🦋", description: "Butterfly" },
    Emoji { symbol: "🌷", description: "Flower" },
    Emoji { symbol: "🌳", description: "Tree" },
    Emoji { symbol: "🌵", description: "Cactus" },
    Emoji { symbol: "🍄", description: "Mushroom" },
    Emoji { symbol: "🌏", description: "Globe" },
    Emoji { symbol: "🌙", description: "Moon" },
    Emoji { symbol: "☁️", description: "Cloud" },
    Emoji { symbol: "🔥", description: "Fire" },
    Emoji { symbol: "🍌", description: "Banana" },
    Emoji { symbol: "🍎", description: "Apple" },
    Emoji { symbol: "🍓", description: "Strawberry" },
    Emoji { symbol: "🌽", description: "Corn" },
    Emoji { symbol: "🍕", description: "Pizza" },
    Emoji { symbol: "🎂", description: "Cake" },
    Emoji { symbol: "❤️", description: "Heart" },
    Emoji { symbol: "😀", description: "Smiley" },
    Emoji { symbol: "🤖", description: "Robot" },
    Emoji { symbol: "🎩", description: "Hat" },
    Emoji { symbol: "👓", description: "Glasses" },
    Emoji { symbol: "🔧", description: "Spanner" },
    Emoji { symbol: "🎅", description: "Santa" },
    Emoji { symbol: "👍", description: "Thumbs Up" },
    Emoji { symbol: "☂️", description: "Umbrella" },
    Emoji { symbol: "⌛", description: "Hourglass" },
    Emoji { symbol: "⏰", description: "Clock" },
    Emoji { symbol: "🎁", description: "Gift" },
    Emoji { symbol: "💡", description: "Light Bulb" },
    Emoji { symbol: "📕", description: "Book" },
    Emoji { symbol: "✏️", description: "Pencil" },
    Emoji { symbol: "📎", description: "Paperclip" },
    Emoji { symbol: "✂️", description: "Scissors" },
    Emoji { symbol: "🔒", description: "Lock" },
    Emoji { symbol: "🔑", description: "Key" },
    Emoji { symbol: "🔨", description: "Hammer" },
    Emoji { symbol: "☎️", description: "Telephone" },
    Emoji { symbol: "🏁", description: "Flag" },
    Emoji { symbol: "🚂", description: "Train" },
    Emoji { symbol: "🚲", description: "Bicycle" },
    Emoji { symbol: "✈️", description: "Aeroplane" },
    Emoji { symbol: "🚀", description: "Rocket" },
    Emoji { symbol: "🏆", description: "Trophy" },
    Emoji { symbol: "⚽", description: "Ball" },
    Emoji { symbol: "🎸", description: "Guitar" },
    Emoji { symbol: "🎺", description: "Trumpet" },
    Emoji { symbol: "🔔", description: "Bell" },
    Emoji { symbol: "⚓", description: "Anchor" },
    Emoji { symbol: "🎧", description: "Headphones" },
    Emoji { symbol: "📁", description: "Folder" },
    Emoji { symbol: "📌", description: "Pin" },
];

/// Get the emoji that belongs to the given index of the SAS emoji table.
///
/// Returns `None` if the index is outside of the table.
pub fn emoji_from_index(index: u8) -> Option<Emoji> {
    EMOJI_TABLE.get(usize::from(index)).cloned()
}

/// Map a list of SAS emoji indices to emojis.
///
/// Indices that don't belong to the table are dropped.
pub fn emojis_from_indices(indices: &[u8]) -> Vec<Emoji> {
    indices.iter().filter_map(|i| emoji_from_index(*i)).collect()
}

/// Format the decimal short auth string, the numbers are joined with a single
/// space.
pub fn decimal_string(decimals: &[u16]) -> String {
    decimals.iter().join(" ")
}

/// Format the given emojis into a single line, symbol above the description,
/// for log output and simple text interfaces.
pub fn format_emojis(emojis: &[Emoji]) -> String {
    let symbols = emojis.iter().map(|e| e.symbol).join("  ");
    let descriptions = emojis.iter().map(|e| e.description).join(" | ");

    format!("{symbols}\n{descriptions}")
}
