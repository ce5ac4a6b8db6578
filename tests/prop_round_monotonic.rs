// Copyright (c) 2026 Alpenhorn Coordinator
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]

use proptest::prelude::*;

use alpenhorn_coordinator::core::types::RoundNumber;

proptest! {
    #[test]
    fn round_number_next_never_decreases(start in 0u32..=u32::MAX, steps in 0usize..64) {
        let mut round = RoundNumber(start);
        let mut previous = round;
        for _ in 0..steps {
            round = round.next();
            prop_assert!(round.0 >= previous.0);
            previous = round;
        }
    }

    #[test]
    fn round_number_next_saturates_at_max(steps in 0usize..8) {
        let mut round = RoundNumber(u32::MAX);
        for _ in 0..steps {
            round = round.next();
            prop_assert_eq!(round.0, u32::MAX);
        }
    }
}
