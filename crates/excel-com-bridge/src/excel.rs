//! The bridge's view of one Excel instance: the application, its single
//! workbook, and every object handed out to the client.

#![cfg(windows)]

use excel_com_protocol::{ErrorValue, ObjectId, Variant};
use windows::Win32::System::Variant::VARIANT;

use crate::dispatch::{
    variant_bool, variant_dispatch, variant_empty, variant_error, variant_f64, variant_get_bool,
    variant_get_dispatch, variant_get_error, variant_get_f64, variant_get_string,
    variant_i32, variant_is_empty, variant_str, variant_vt, ComError, DispatchObject,
};
use crate::table::ObjectTable;

/// `CVErr` codes and their display text.
const CELL_ERRORS: &[(i32, &str)] = &[
    (2000, "#NULL!"),
    (2007, "#DIV/0!"),
    (2015, "#VALUE!"),
    (2023, "#REF!"),
    (2029, "#NAME?"),
    (2036, "#NUM!"),
    (2042, "#N/A"),
];
const CELL_ERROR_BASE: i32 = 0x800A_0000_u32 as i32;

pub struct ExcelHost {
    app: DispatchObject,
    workbook: DispatchObject,
    objects: ObjectTable<DispatchObject>,
}

impl ExcelHost {
    /// Start Excel and open `path`, or add a new workbook when `path` is
    /// `None`. The workbook is registered as the first object.
    pub fn start(path: Option<&str>, visible: bool) -> Result<(Self, ObjectId), ComError> {
        let app = DispatchObject::create_from_progid("Excel.Application")?;
        app.set_property("DisplayAlerts", variant_bool(false))?;
        app.set_property("Visible", variant_bool(visible))?;

        let workbooks = expect_object(app.get_property("Workbooks", &[])?, "Workbooks")?;
        let workbook = match path {
            Some(path) => workbooks.invoke_method("Open", &[variant_str(path)])?,
            None => workbooks.invoke_method("Add", &[])?,
        };
        let workbook = expect_object(workbook, "Workbook")?;

        let mut objects = ObjectTable::new();
        let root = objects.insert(workbook.clone());
        Ok((
            Self {
                app,
                workbook,
                objects,
            },
            root,
        ))
    }

    pub fn get_property(
        &mut self,
        target: ObjectId,
        name: &str,
        args: &[Variant],
    ) -> Result<Variant, ComError> {
        let args = self.to_variants(args)?;
        let value = self.objects.get(target)?.get_property(name, &args)?;
        Ok(self.from_variant(&value))
    }

    pub fn set_property(
        &mut self,
        target: ObjectId,
        name: &str,
        value: &Variant,
    ) -> Result<(), ComError> {
        let value = self.to_variant(value)?;
        self.objects.get(target)?.set_property(name, value)
    }

    pub fn invoke(
        &mut self,
        target: ObjectId,
        name: &str,
        args: &[Variant],
    ) -> Result<Variant, ComError> {
        let args = self.to_variants(args)?;
        let value = self.objects.get(target)?.invoke_method(name, &args)?;
        Ok(self.from_variant(&value))
    }

    pub fn release(&mut self, handle: ObjectId) -> Result<(), ComError> {
        self.objects.remove(handle)?;
        Ok(())
    }

    /// A property read that has to go through Excel's message loop.
    pub fn ping(&self) -> Result<(), ComError> {
        self.app.get_property("Ready", &[])?;
        Ok(())
    }

    pub fn save(&self, path: Option<&str>) -> Result<(), ComError> {
        match path {
            Some(path) => {
                self.workbook
                    .invoke_method("SaveAs", &[variant_str(path), variant_i32(file_format(path))])?;
            }
            None => {
                self.workbook.invoke_method("Save", &[])?;
            }
        }
        Ok(())
    }

    pub fn set_visible(&self, visible: bool) -> Result<(), ComError> {
        self.app.set_property("Visible", variant_bool(visible))
    }

    /// Close the workbook without saving and quit. Outstanding objects are
    /// dropped first so Excel can exit.
    pub fn shutdown(mut self) -> Result<(), ComError> {
        let outstanding = self.objects.len();
        if outstanding > 0 {
            eprintln!("[excel-com-bridge] dropping {outstanding} unreleased object(s)");
        }
        self.objects.clear();
        if let Err(e) = self.workbook.invoke_method("Close", &[variant_bool(false)]) {
            eprintln!("[excel-com-bridge] workbook close failed: {}", e.message);
        }
        self.app.invoke_method("Quit", &[])?;
        Ok(())
    }

    fn to_variants(&self, values: &[Variant]) -> Result<Vec<VARIANT>, ComError> {
        values.iter().map(|v| self.to_variant(v)).collect()
    }

    fn to_variant(&self, value: &Variant) -> Result<VARIANT, ComError> {
        Ok(match value {
            Variant::Null => variant_empty(),
            Variant::Bool(b) => variant_bool(*b),
            Variant::Number(n) => variant_f64(*n),
            Variant::String(s) => variant_str(s),
            Variant::Object { handle } => variant_dispatch(self.objects.get(*handle)?.as_idispatch()),
            Variant::Error(e) => {
                let code = CELL_ERRORS
                    .iter()
                    .find(|(_, text)| *text == e.code)
                    .map(|(code, _)| *code)
                    .ok_or_else(|| ComError::msg(format!("Unknown error value: {}", e.code)))?;
                variant_error(CELL_ERROR_BASE | code)
            }
        })
    }

    /// Objects in `value` are registered in the table; the client owns them
    /// from here on.
    fn from_variant(&mut self, value: &VARIANT) -> Variant {
        if variant_is_empty(value) {
            Variant::Null
        } else if let Some(disp) = variant_get_dispatch(value) {
            let handle = self.objects.insert(DispatchObject::from_idispatch(disp));
            Variant::Object { handle }
        } else if let Some(b) = variant_get_bool(value) {
            Variant::Bool(b)
        } else if let Some(n) = variant_get_f64(value) {
            Variant::Number(n)
        } else if let Some(s) = variant_get_string(value) {
            Variant::String(s)
        } else if let Some(scode) = variant_get_error(value) {
            let code = scode & 0xFFFF;
            let text = CELL_ERRORS
                .iter()
                .find(|(c, _)| *c == code)
                .map(|(_, text)| text.to_string())
                .unwrap_or_else(|| format!("#ERR({code})"));
            Variant::Error(ErrorValue { code: text })
        } else {
            eprintln!(
                "[excel-com-bridge] unsupported VARIANT type {}, returning null",
                variant_vt(value)
            );
            Variant::Null
        }
    }
}

fn expect_object(value: VARIANT, what: &str) -> Result<DispatchObject, ComError> {
    variant_get_dispatch(&value)
        .map(DispatchObject::from_idispatch)
        .ok_or_else(|| ComError::msg(format!("'{what}' did not return an object")))
}

/// xlOpenXMLWorkbook = 51, xlOpenXMLWorkbookMacroEnabled = 52,
/// xlExcel8 = 56, xlCSV = 6.
fn file_format(path: &str) -> i32 {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".xlsm") {
        52
    } else if lower.ends_with(".xls") {
        56
    } else if lower.ends_with(".csv") {
        6
    } else {
        51
    }
}
