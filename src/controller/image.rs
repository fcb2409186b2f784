//! Image attach and detach.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{ItemGuard, Mutation, Rejection, TodoController};
use crate::backend::{RemoteError, UploadOptions};
use crate::notice::Action;
use crate::todo::image::storage_path_for;
use crate::todo::{ImageRef, ImageUpload, ItemId, TodoPatch};

impl TodoController {
    pub async fn attach_image(&self, id: ItemId, upload: ImageUpload) -> Mutation<ImageRef> {
        let guard = match self.begin(id) {
            Ok(guard) => guard,
            Err(rejection) => return Mutation::Rejected(rejection),
        };

        if self.lock().list.get(id).is_some_and(|item| item.has_image()) {
            return Mutation::Rejected(Rejection::ImageAlreadyAttached(id));
        }
        if let Err(rejection) = self.validate_upload(&upload) {
            return Mutation::Rejected(rejection);
        }

        let user = match self.backends.auth.current_session().await {
            Ok(Some(session)) => session.user,
            Ok(None) => return Mutation::Rejected(Rejection::NotSignedIn),
            Err(e) => return self.roll_back(Action::AttachImage, e),
        };

        match self.attach_with_guard(&guard, &user.id, upload).await {
            Ok(image) => Mutation::Applied(image),
            Err(e) => self.roll_back(Action::AttachImage, e),
        }
    }

    pub async fn detach_image(&self, id: ItemId) -> Mutation {
        let _guard = match self.begin(id) {
            Ok(guard) => guard,
            Err(rejection) => return Mutation::Rejected(rejection),
        };

        let image = self.lock().list.get(id).and_then(|item| item.image.clone());
        let Some(image) = image else {
            return Mutation::Rejected(Rejection::NoImageAttached(id));
        };
        let Some(path) = self.resolve_image_path(&image) else {
            warn!(id = %id, url = %image.url, "unrecognized image reference, detach aborted");
            return Mutation::Rejected(Rejection::UnrecognizedImageReference(id));
        };

        match self.detach_with_path(id, &path).await {
            Ok(()) => Mutation::Applied(()),
            Err(e) => self.roll_back(Action::DetachImage, e),
        }
    }

    /// Upload, then link. The item shows as uploading for the duration.
    pub(super) async fn attach_with_guard(
        &self,
        guard: &ItemGuard<'_>,
        user_id: &str,
        upload: ImageUpload,
    ) -> Result<ImageRef, RemoteError> {
        let id = guard.id;
        self.lock().uploading.insert(id);
        let result = self.upload_and_link(id, user_id, upload).await;
        self.lock().uploading.remove(&id);
        result
    }

    async fn upload_and_link(
        &self,
        id: ItemId,
        user_id: &str,
        upload: ImageUpload,
    ) -> Result<ImageRef, RemoteError> {
        let path = storage_path_for(user_id, id, Utc::now(), &upload.extension());
        let options = UploadOptions {
            content_type: upload.content_type.clone(),
            overwrite: false,
        };
        let size = upload.size();

        self.backends.storage.upload(&path, upload.bytes, options).await?;
        debug!(id = %id, path = %path, size, "image uploaded");

        let image = ImageRef::new(self.backends.storage.public_url(&path), path.clone());
        if let Err(e) = self
            .backends
            .store
            .update(id, TodoPatch::image(Some(image.clone())))
            .await
        {
            match self.backends.storage.delete(&path).await {
                Ok(()) => debug!(path = %path, "removed orphaned upload"),
                Err(cleanup) => warn!(path = %path, error = %cleanup, "failed to remove orphaned upload"),
            }
            return Err(e);
        }

        self.lock().list.set_image(id, Some(image.clone()));
        info!(id = %id, "image attached");
        Ok(image)
    }

    /// Delete the stored object, then clear the reference remotely and locally.
    /// A failed object delete is logged and does not stop the clear.
    pub(super) async fn detach_with_path(&self, id: ItemId, path: &str) -> Result<(), RemoteError> {
        if let Err(e) = self.backends.storage.delete(path).await {
            warn!(id = %id, path, error = %e, "failed to delete stored image, clearing reference anyway");
        }

        self.backends.store.update(id, TodoPatch::image(None)).await?;
        self.lock().list.set_image(id, None);
        info!(id = %id, "image detached");
        Ok(())
    }

    /// Stored path first, derived from the URL only for older rows
    pub(super) fn resolve_image_path(&self, image: &ImageRef) -> Option<String> {
        image
            .path
            .clone()
            .or_else(|| self.backends.storage.path_for_url(&image.url))
    }
}
