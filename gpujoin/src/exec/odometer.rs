// Copyright 2018-2022 Clemens Lutz
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

/// Enumerates the windows of the inner relations.
///
/// `index[d]` selects the sub-chunk of depth `d + 1`. The last depth is the
/// least significant digit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Odometer {
    limits: Vec<usize>,
    index: Vec<usize>,
}

impl Odometer {
    /// Creates an odometer over `limits[d]` sub-chunks per depth.
    pub fn new(limits: Vec<usize>) -> Self {
        let index = vec![0; limits.len()];
        Self { limits, index }
    }

    pub fn current(&self) -> &[usize] {
        &self.index
    }

    /// Number of windows in a full enumeration.
    pub fn windows(&self) -> usize {
        self.limits.iter().product()
    }

    /// Moves to the next window. Returns `false` once all windows were
    /// visited, leaving the index unchanged.
    pub fn advance(&mut self) -> bool {
        let digit = match (0..self.limits.len())
            .rev()
            .find(|&d| self.index[d] + 1 < self.limits[d])
        {
            Some(digit) => digit,
            None => return false,
        };

        self.index[digit] += 1;
        self.index[digit + 1..].iter_mut().for_each(|i| *i = 0);
        true
    }

    pub fn reset(&mut self) {
        self.index.iter_mut().for_each(|i| *i = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn visits_the_cartesian_product_once() {
        let mut odometer = Odometer::new(vec![2, 1, 3]);
        let mut seen = vec![odometer.current().to_vec()];
        while odometer.advance() {
            seen.push(odometer.current().to_vec());
        }

        assert_eq!(seen.len(), odometer.windows());
        assert_eq!(seen.iter().cloned().collect::<HashSet<_>>().len(), 6);
        assert_eq!(seen[1], vec![0, 0, 1]);
        assert_eq!(seen[3], vec![1, 0, 0]);
        assert_eq!(odometer.current(), &[1, 0, 2]);
    }

    #[test]
    fn single_window_does_not_advance() {
        let mut odometer = Odometer::new(vec![1, 1]);
        assert!(!odometer.advance());
        assert_eq!(odometer.current(), &[0, 0]);
    }

    #[test]
    fn reset_restarts_enumeration() {
        let mut odometer = Odometer::new(vec![3]);
        assert!(odometer.advance());
        assert!(odometer.advance());
        odometer.reset();
        assert_eq!(odometer.current(), &[0]);
    }
}
