use std::collections::HashMap;

/// ポーリング対象カテゴリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollCategory {
    Listings,
    Bids,
    Messages,
    Comments,
}

/// 全カテゴリ（dueの返り値の順序もこれに従う）
pub const ALL_CATEGORIES: [PollCategory; 4] = [
    PollCategory::Bids,
    PollCategory::Messages,
    PollCategory::Comments,
    PollCategory::Listings,
];

/// カテゴリ毎の既定間隔（秒）。変動の激しい入札が最短、出品が最長
pub fn default_interval(category: PollCategory) -> i64 {
    match category {
        PollCategory::Bids => 10,
        PollCategory::Messages => 30,
        PollCategory::Comments => 45,
        PollCategory::Listings => 60,
    }
}

/// 再問い合わせ周期の一元管理
///
/// タイマーを各呼び出し箇所に散らさず、UI側のtickから
/// due()で期限のきたカテゴリを取り出して再問い合わせする
pub struct PollScheduler {
    intervals: HashMap<PollCategory, i64>,
    last_polled: HashMap<PollCategory, i64>,
}

impl PollScheduler {
    pub fn new() -> Self {
        let intervals = ALL_CATEGORIES
            .iter()
            .map(|&c| (c, default_interval(c)))
            .collect();
        Self {
            intervals,
            last_polled: HashMap::new(),
        }
    }

    pub fn set_interval(&mut self, category: PollCategory, seconds: i64) {
        self.intervals.insert(category, seconds.max(1));
    }

    pub fn interval(&self, category: PollCategory) -> i64 {
        self.intervals
            .get(&category)
            .copied()
            .unwrap_or_else(|| default_interval(category))
    }

    /// 期限のきたカテゴリ（未実行のものは即due）
    pub fn due(&self, now: i64) -> Vec<PollCategory> {
        ALL_CATEGORIES
            .iter()
            .filter(|&&category| match self.last_polled.get(&category) {
                Some(last) => now - last >= self.interval(category),
                None => true,
            })
            .copied()
            .collect()
    }

    pub fn mark_polled(&mut self, category: PollCategory, now: i64) {
        self.last_polled.insert(category, now);
    }
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}
