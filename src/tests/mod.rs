// Settle Node: multi-contract settlement engine for tokenized assets.
//
// Written in 2022 by
//     The Settle Node developers.
//
// Copyright (C) 2022 by the Settle Node developers, Switzerland.
//
// You should have received a copy of the MIT License along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Cross-component scenarios driving the full settlement engine through
//! the dispatcher, with an in-memory storage backend and a captured
//! broadcast channel.

mod support;
mod transfers;
