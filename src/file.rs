/*!
The built-in [File] type: a savable object whose content lives in the
archive's blob store.

Content is buffered in memory and persisted as a blob when the file
object is saved; loading a file reads the blob back.  File equality is
content (and name) equality.
*/

use std::any::{self, Any};
use std::cell::{Cell, RefCell};

use uuid::Uuid;

use crate::archive::{Archive, FileId};
use crate::depositor::{Loader, Saver};
use crate::equator::HashWalk;
use crate::helper::{TypeHelper, TypeId};
use crate::object::{new_obj, Node, Obj, ObjExt};
use crate::value::Value;

/// A named blob of data stored alongside the records.
#[derive(Debug, Clone, Default)]
pub struct File {
    filename: Option<String>,
    encoding: Option<String>,
    file_id: Cell<Option<FileId>>,
    content: RefCell<Vec<u8>>,
}

impl File {
    /// The stable type id files are stored under.
    pub const TYPE_ID: TypeId =
        TypeId(Uuid::from_u128(0x7de4_19c2_55b0_4a8f_93ce_10aa_8f67_b542));

    /// Create an empty file.
    pub fn new(filename: Option<String>, encoding: Option<String>) -> File {
        File {
            filename,
            encoding,
            file_id: Cell::new(None),
            content: RefCell::new(Vec::new()),
        }
    }

    /// The name of the file, if it has one.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// The declared text encoding, if any.
    pub fn encoding(&self) -> Option<&str> {
        self.encoding.as_deref()
    }

    /// The blob id, assigned at first save.
    pub fn file_id(&self) -> Option<FileId> {
        self.file_id.get()
    }

    /// Replace the content with the given text.
    pub fn write_text(&self, text: &str) {
        *self.content.borrow_mut() = text.as_bytes().to_vec();
    }

    /// The content interpreted as UTF-8 text.
    pub fn read_text(&self) -> String {
        String::from_utf8_lossy(&self.content.borrow()).into_owned()
    }

    /// Replace the content with raw bytes.
    pub fn write_bytes(&self, data: &[u8]) {
        *self.content.borrow_mut() = data.to_vec();
    }

    /// The raw content.
    pub fn read_bytes(&self) -> Vec<u8> {
        self.content.borrow().clone()
    }
}

/// Two files are equal when their names and contents are.
impl PartialEq for File {
    fn eq(&self, other: &File) -> bool {
        self.filename == other.filename && *self.content.borrow() == *other.content.borrow()
    }
}

/// The helper that persists [File]s, writing their blob on save.
pub struct FileHelper;

impl TypeHelper for FileHelper {
    fn type_id(&self) -> TypeId {
        File::TYPE_ID
    }

    fn type_name(&self) -> &'static str {
        "File"
    }

    fn handled_type(&self) -> any::TypeId {
        any::TypeId::of::<File>()
    }

    fn new_instance(&self, _state: &Node) -> anyhow::Result<Obj> {
        Ok(new_obj(File::default()))
    }

    fn yield_hashables(&self, obj: &dyn Any, walk: &mut HashWalk<'_>) -> anyhow::Result<()> {
        let file = downcast_file(obj)?;
        match file.filename() {
            Some(name) => walk.write(name.as_bytes()),
            None => walk.value(&Value::Null),
        }
        walk.write(&file.content.borrow());
        Ok(())
    }

    fn eq(&self, one: &dyn Any, other: &dyn Any) -> bool {
        match (one.downcast_ref::<File>(), other.downcast_ref::<File>()) {
            (Some(one), Some(two)) => one == two,
            _ => false,
        }
    }

    fn save_instance_state(
        &self,
        obj: &dyn Any,
        saver: &mut Saver<'_>,
    ) -> anyhow::Result<Node> {
        let file = downcast_file(obj)?;
        let file_id = match file.file_id.get() {
            Some(file_id) => file_id,
            None => {
                let file_id = saver.archive().create_file_id();
                file.file_id.set(Some(file_id));
                file_id
            }
        };
        saver.archive().write_file(&file_id, &file.content.borrow())?;
        Ok([
            (
                "filename".to_string(),
                file.filename
                    .as_ref()
                    .map_or(Node::null(), |name| Node::from(name.clone())),
            ),
            (
                "encoding".to_string(),
                file.encoding
                    .as_ref()
                    .map_or(Node::null(), |enc| Node::from(enc.clone())),
            ),
            ("file_id".to_string(), Node::from(file_id.to_string())),
        ]
        .into_iter()
        .collect())
    }

    fn load_instance_state(
        &self,
        obj: &Obj,
        state: &Node,
        loader: &mut Loader<'_>,
    ) -> anyhow::Result<()> {
        let filename = match state.entry("filename")? {
            node if node.is_null() => None,
            node => Some(node.as_str()?.to_string()),
        };
        let encoding = match state.entry("encoding")? {
            node if node.is_null() => None,
            node => Some(node.as_str()?.to_string()),
        };
        let file_id: FileId = state.entry("file_id")?.as_str()?.parse()?;
        let content = loader.historian().archive().read_file(&file_id)?;

        let mut file = obj.borrow_mut_as::<File>()?;
        file.filename = filename;
        file.encoding = encoding;
        file.file_id.set(Some(file_id));
        *file.content.borrow_mut() = content;
        Ok(())
    }

    fn copy_instance(&self, obj: &dyn Any) -> anyhow::Result<Obj> {
        let file = downcast_file(obj)?;
        let copy = file.clone();
        // The copy gets its own blob at the next save.
        copy.file_id.set(None);
        Ok(new_obj(copy))
    }
}

fn downcast_file(obj: &dyn Any) -> anyhow::Result<&File> {
    obj.downcast_ref::<File>()
        .ok_or_else(|| anyhow::anyhow!("object is not a File"))
}
