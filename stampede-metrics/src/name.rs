/// Builds a series name of the form `base{k1=v1,k2=v2}` with tags sorted by key.
///
/// An empty tag list yields `base` unchanged.
pub fn tagged_metric_name(base: &str, tags: &[(&str, &str)]) -> String {
    if tags.is_empty() {
        return base.to_string();
    }

    let mut sorted: Vec<(&str, &str)> = tags.to_vec();
    sorted.sort_unstable();

    let mut out = String::with_capacity(
        base.len() + 2 + sorted.iter().map(|(k, v)| k.len() + v.len() + 2).sum::<usize>(),
    );
    out.push_str(base);
    out.push('{');
    for (i, (k, v)) in sorted.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out.push('}');
    out
}

/// Splits `base{k=v,...}` into the base name and its tag pairs.
///
/// Names without a well-formed tag block are returned whole with no tags.
pub fn split_metric_name(name: &str) -> (&str, Vec<(&str, &str)>) {
    let Some(open) = name.find('{') else {
        return (name, Vec::new());
    };
    let Some(inner) = name[open + 1..].strip_suffix('}') else {
        return (name, Vec::new());
    };

    let tags = inner
        .split(',')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .collect();

    (&name[..open], tags)
}

/// Whether `value` can be used as a tag key or value without breaking the `base{k=v}` form.
pub fn is_plain_tag(value: &str) -> bool {
    !value.is_empty() && !value.contains(['{', '}', ',', '='])
}
