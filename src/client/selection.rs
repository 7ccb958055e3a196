// 批次选择
//
// 在并发流预算内选一组等待文件，使分片数之和最大（背包式子集选择）。
// 候选数受 max_file_selection 限制（<=60），回溯搜索可接受；
// 命中预算上限即提前终止

/// 从候选 (文件标识, 分片数) 中选出分片数之和不超过 capacity 且最大的子集
///
/// 按声明顺序搜索，和相同时偏向靠前的文件；
/// 所有候选都放不进预算时返回空集，由调用方强制放行首个文件
pub fn select_batch(candidates: &[(String, u32)], capacity: u32) -> Vec<String> {
    if candidates.is_empty() || capacity == 0 {
        return Vec::new();
    }

    let parts: Vec<u32> = candidates.iter().map(|(_, p)| *p).collect();
    let mut best: (u32, Vec<usize>) = (0, Vec::new());
    let mut chosen = Vec::new();
    search(&parts, 0, 0, capacity, &mut chosen, &mut best);

    best.1
        .into_iter()
        .map(|i| candidates[i].0.clone())
        .collect()
}

/// 回溯搜索，先走"选入"分支保证声明顺序优先
fn search(
    parts: &[u32],
    index: usize,
    sum: u32,
    capacity: u32,
    chosen: &mut Vec<usize>,
    best: &mut (u32, Vec<usize>),
) {
    if sum > best.0 {
        *best = (sum, chosen.clone());
    }
    if best.0 == capacity || index >= parts.len() {
        return;
    }

    if sum + parts[index] <= capacity {
        chosen.push(index);
        search(parts, index + 1, sum + parts[index], capacity, chosen, best);
        chosen.pop();
        if best.0 == capacity {
            return;
        }
    }

    search(parts, index + 1, sum, capacity, chosen, best);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(parts: &[u32]) -> Vec<(String, u32)> {
        parts
            .iter()
            .enumerate()
            .map(|(i, p)| (format!("f{}", i), *p))
            .collect()
    }

    fn total(selected: &[String], candidates: &[(String, u32)]) -> u32 {
        selected
            .iter()
            .map(|id| candidates.iter().find(|(c, _)| c == id).unwrap().1)
            .sum()
    }

    #[test]
    fn test_exact_fill() {
        let c = candidates(&[3, 5, 2, 4]);
        let selected = select_batch(&c, 8);
        assert_eq!(total(&selected, &c), 8);
    }

    #[test]
    fn test_maximal_not_exact() {
        // 没有恰好 8 的组合，取最大的 7
        let c = candidates(&[4, 3, 6]);
        let selected = select_batch(&c, 8);
        assert_eq!(total(&selected, &c), 7);
        assert_eq!(selected, vec!["f0", "f1"]);
    }

    #[test]
    fn test_declaration_order_preference() {
        // 两种组合都能到 8，取先找到的（含首个文件）
        let c = candidates(&[4, 4, 8]);
        let selected = select_batch(&c, 8);
        assert_eq!(selected, vec!["f0", "f1"]);
    }

    #[test]
    fn test_all_fit() {
        let c = candidates(&[1, 2, 3]);
        let selected = select_batch(&c, 8);
        assert_eq!(selected.len(), 3);
        assert_eq!(total(&selected, &c), 6);
    }

    #[test]
    fn test_oversized_returns_empty() {
        // 单个文件超过预算：空集，由调度器强制放行
        let c = candidates(&[16]);
        assert!(select_batch(&c, 8).is_empty());
    }

    #[test]
    fn test_oversized_mixed() {
        let c = candidates(&[16, 3, 5]);
        let selected = select_batch(&c, 8);
        assert_eq!(selected, vec!["f1", "f2"]);
    }

    #[test]
    fn test_maximality_property() {
        // 选出的和必须不小于任何合法子集的和
        let c = candidates(&[5, 4, 3, 2, 1]);
        let selected = select_batch(&c, 8);
        let t = total(&selected, &c);
        assert_eq!(t, 8);
        assert!(t <= 8);
    }

    #[test]
    fn test_empty_input() {
        assert!(select_batch(&[], 8).is_empty());
        assert!(select_batch(&candidates(&[1]), 0).is_empty());
    }

    #[test]
    fn test_larger_pool_terminates_quickly() {
        // 60 个候选命中预算即提前终止
        let parts: Vec<u32> = (0..60).map(|i| (i % 4) + 1).collect();
        let c = candidates(&parts);
        let selected = select_batch(&c, 8);
        assert_eq!(total(&selected, &c), 8);
    }
}
