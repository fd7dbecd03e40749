use anyhow::Result;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use lightmon_common::containers::ContainerRecord;

/// Docker shows short ids with this many characters.
const SHORT_ID_LEN: usize = 12;

pub struct TermPrinted;

pub trait TermPrintable {
    fn term_print(&self) -> Result<TermPrinted>;
}

impl TermPrintable for String {
    fn term_print(&self) -> Result<TermPrinted> {
        println!("{self}");
        Ok(TermPrinted)
    }
}

impl TermPrintable for Vec<ContainerRecord> {
    fn term_print(&self) -> Result<TermPrinted> {
        if self.is_empty() {
            return "No running containers".to_string().term_print();
        }

        println!("{}", containers_table(self));
        Ok(TermPrinted)
    }
}

fn containers_table(records: &[ContainerRecord]) -> Table {
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let mut table = table();

    table.set_header(vec![
        Cell::new("ID").add_attribute(Attribute::Bold),
        Cell::new("NAME").add_attribute(Attribute::Bold),
        Cell::new("INIT PID").add_attribute(Attribute::Bold),
        Cell::new("PARENT PID").add_attribute(Attribute::Bold),
    ]);

    for record in sorted {
        table.add_row(vec![
            Cell::new(short_id(&record.id)),
            Cell::new(record.name)
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
            Cell::new(record.init_pid),
            Cell::new(record.parent_pid),
        ]);
    }

    table
}

fn short_id(id: &str) -> &str {
    id.char_indices()
        .nth(SHORT_ID_LEN)
        .map_or(id, |(end, _)| &id[..end])
}

fn table() -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table
}
