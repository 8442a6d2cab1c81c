pub const FILE: &str = file!();

pub fn get_letters() -> Vec<String> {
    let mut letters = Vec::new();
    for c in 'a'..='z' {
        letters.push(c.to_string().repeat(64));
    }
    letters
}
