use std::collections::HashSet;

/// Returns `name` if it is free, otherwise the first `"base (n).ext"` that
/// is not in `existing`. A base already ending in `" (k)"` continues from
/// `k + 1`.
pub fn suggest_new_name(name: &str, existing: &HashSet<String>) -> String {
    if !existing.contains(name) {
        return name.to_string();
    }

    let (base, ext) = split_extension(name);
    let (stem, mut counter) = match parse_counter(base) {
        Some((stem, k)) => (stem, k.saturating_add(1)),
        None => (base, 1),
    };
    loop {
        let candidate = format!("{stem} ({counter}){ext}");
        if !existing.contains(&candidate) {
            return candidate;
        }
        counter = counter.saturating_add(1);
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

fn parse_counter(base: &str) -> Option<(&str, u64)> {
    let inner = base.strip_suffix(')')?;
    let open = inner.rfind(" (")?;
    let digits = &inner[open + 2..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((&inner[..open], digits.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn free_name_is_returned_unchanged() {
        assert_eq!(suggest_new_name("notes.txt", &names(&["report.docx"])), "notes.txt");
    }

    #[test]
    fn counter_increments_past_taken_names() {
        assert_eq!(
            suggest_new_name("report.docx", &names(&["report.docx"])),
            "report (1).docx"
        );
        assert_eq!(
            suggest_new_name("report.docx", &names(&["report.docx", "report (1).docx"])),
            "report (2).docx"
        );
    }

    #[test]
    fn existing_counter_is_continued() {
        assert_eq!(
            suggest_new_name("report (4).docx", &names(&["report (4).docx"])),
            "report (5).docx"
        );
    }

    #[test]
    fn names_without_extension_or_with_leading_dot() {
        assert_eq!(suggest_new_name("photos", &names(&["photos"])), "photos (1)");
        assert_eq!(suggest_new_name(".bashrc", &names(&[".bashrc"])), ".bashrc (1)");
        assert_eq!(
            suggest_new_name("a.tar.gz", &names(&["a.tar.gz"])),
            "a.tar (1).gz"
        );
    }

    #[test]
    fn suggestion_is_stable_and_never_collides() {
        let taken = names(&["x.txt", "x (1).txt", "x (2).txt"]);
        let first = suggest_new_name("x.txt", &taken);
        assert_eq!(first, suggest_new_name("x.txt", &taken));
        assert!(!taken.contains(&first));
    }
}
